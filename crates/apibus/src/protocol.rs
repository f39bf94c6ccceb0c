//! Wire-protocol boundary: the fixed command vocabulary a transport
//! multiplexer speaks, and the authorization hook evaluated before
//! dispatch. No transport implementation lives here.

use async_trait::async_trait;
use serde_json::Value;

use apibus_validator::JsonMap;

/// Protocol command codes. The numeric values are part of the wire
/// contract and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Hello = 1,
    Response = 2,
    Error = 5,
    Auth = 6,
    SrvCall = 11,
    SrvSubscribe = 21,
    SrvUnsubscribe = 22,
    SrvPublish = 23,
    SrvSubscribeQueue = 31,
    SrvUnsubscribeQueue = 32,
    SrvEnqueue = 33,
    CliCall = 41,
    CliMessage = 42,
    CliQueueMessage = 43,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Command> {
        Some(match code {
            1 => Command::Hello,
            2 => Command::Response,
            5 => Command::Error,
            6 => Command::Auth,
            11 => Command::SrvCall,
            21 => Command::SrvSubscribe,
            22 => Command::SrvUnsubscribe,
            23 => Command::SrvPublish,
            31 => Command::SrvSubscribeQueue,
            32 => Command::SrvUnsubscribeQueue,
            33 => Command::SrvEnqueue,
            41 => Command::CliCall,
            42 => Command::CliMessage,
            43 => Command::CliQueueMessage,
            _ => return None,
        })
    }
}

/// Transport session state the auth hook sees: set once by the `auth`
/// command, carried for the connection's lifetime.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    pub authenticated: bool,
    pub attributes: JsonMap,
}

/// An action a connected peer is asking to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    Call { path: String, method: String },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String },
    SubscribeQueue { queue: String },
    UnsubscribeQueue { queue: String },
    Enqueue { queue: String },
}

/// Authorization hook a transport evaluates before handing a command to
/// the dispatch engine.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    /// Validates credentials presented by the `auth` command and returns
    /// the session attributes to carry, or `None` to reject.
    async fn authenticate(&self, credentials: &Value) -> Option<JsonMap>;

    async fn authorize(&self, session: &Session, action: &AuthAction) -> bool;
}

/// Policy that accepts any credentials and allows every action.
pub struct AllowAll;

#[async_trait]
impl AuthPolicy for AllowAll {
    async fn authenticate(&self, _credentials: &Value) -> Option<JsonMap> {
        Some(JsonMap::new())
    }

    async fn authorize(&self, _session: &Session, _action: &AuthAction) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        let commands = [
            Command::Hello,
            Command::Response,
            Command::Error,
            Command::Auth,
            Command::SrvCall,
            Command::SrvSubscribe,
            Command::SrvUnsubscribe,
            Command::SrvPublish,
            Command::SrvSubscribeQueue,
            Command::SrvUnsubscribeQueue,
            Command::SrvEnqueue,
            Command::CliCall,
            Command::CliMessage,
            Command::CliQueueMessage,
        ];
        for command in commands {
            assert_eq!(Command::from_code(command.code()), Some(command));
        }
        assert_eq!(Command::from_code(0), None);
        assert_eq!(Command::from_code(99), None);
    }

    #[tokio::test]
    async fn allow_all_policy() {
        let policy = AllowAll;
        assert!(policy.authenticate(&Value::Null).await.is_some());
        let session = Session::default();
        let actions = [
            AuthAction::Call {
                path: "/users".into(),
                method: "query".into(),
            },
            AuthAction::SubscribeQueue {
                queue: "jobs".into(),
            },
            AuthAction::UnsubscribeQueue {
                queue: "jobs".into(),
            },
        ];
        for action in &actions {
            assert!(policy.authorize(&session, action).await);
        }
    }
}
