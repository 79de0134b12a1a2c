//! Transport used when no real transport could be loaded

use tokio::sync::broadcast;

use super::{ActionRequest, HelperTransport, TransportEvent};
use crate::reply::ActionReply;

/// Answers every request with `NoSuchAction`
pub struct FakeHelperTransport {
    events: broadcast::Sender<TransportEvent>,
}

impl FakeHelperTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self { events }
    }
}

impl Default for FakeHelperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HelperTransport for FakeHelperTransport {
    fn execute_action(&self, request: ActionRequest) {
        let _ = self.events.send(TransportEvent::ActionPerformed {
            action: request.action,
            request_id: Some(request.request_id),
            reply: ActionReply::no_such_action_reply(),
        });
    }

    fn stop_action(&self, _action: &str, _helper_id: &str) {}

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{DetailsMap, VariantMap};
    use crate::reply::ErrorCode;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fake_transport_reports_no_such_action() {
        let transport = FakeHelperTransport::new();
        let mut rx = transport.subscribe();
        let ticket = Uuid::new_v4();

        transport.execute_action(ActionRequest {
            request_id: ticket,
            action: "org.example.demo.read".to_string(),
            helper_id: "org.example.demo".to_string(),
            details: DetailsMap::new(),
            arguments: VariantMap::new(),
            timeout: None,
        });

        match rx.recv().await.unwrap() {
            TransportEvent::ActionPerformed {
                request_id, reply, ..
            } => {
                assert_eq!(request_id, Some(ticket));
                assert_eq!(reply.error_code(), Some(ErrorCode::NoSuchAction));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
