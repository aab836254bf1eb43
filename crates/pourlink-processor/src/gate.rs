//! [`CommandGate`] – the single interception point between viewers and the
//! robot.
//!
//! Every outbound command, no matter where it was submitted from, passes
//! through [`CommandGate::submit`] before it can reach the broker. The gate
//! enforces two checks in order:
//!
//! 1. **Bounds check** ([`CommandValidator`]): parameters are clamped into
//!    the robot's limits, structurally invalid commands are rejected. An
//!    invalid command reports its real rejection reason even while the
//!    broker is down.
//! 2. **Link check**: a valid command submitted while the broker is
//!    disconnected is rejected immediately with
//!    [`BridgeError::NotConnected`]; nothing is queued.
//!
//! Accepted commands are published on `robot/control` at a QoS derived from
//! their safety level, then echoed into the pipeline intake so the snapshot
//! and every viewer see them.

use std::sync::Arc;

use pourlink_broker::BrokerHandle;
use pourlink_types::{
    BridgeError, CommandRequest, PublishAck, QoS, SafetyLevel, Update, ValidatedCommand,
};
use pourlink_validators::CommandValidator;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

/// Command validator shared between the gate and the pipeline's echo path.
pub type SharedCommandValidator = Arc<Mutex<CommandValidator>>;

/// Topic all outbound commands are published on.
pub const CONTROL_TOPIC: &str = "robot/control";

/// QoS assigned to an outbound command by safety level. Stops must survive
/// exactly once; motion commands need acknowledged delivery; the rest are
/// fire-and-forget.
pub fn qos_for(level: SafetyLevel) -> QoS {
    match level {
        SafetyLevel::Critical => QoS::ExactlyOnce,
        SafetyLevel::Normal | SafetyLevel::Safe => QoS::AtLeastOnce,
        SafetyLevel::Low | SafetyLevel::Blocked => QoS::AtMostOnce,
    }
}

pub struct CommandGate {
    validator: SharedCommandValidator,
    broker: BrokerHandle,
    intake: mpsc::Sender<Update>,
    connectivity: watch::Receiver<bool>,
}

impl CommandGate {
    pub fn new(
        validator: SharedCommandValidator,
        broker: BrokerHandle,
        intake: mpsc::Sender<Update>,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            validator,
            broker,
            intake,
            connectivity,
        }
    }

    /// Validate and dispatch one command.
    ///
    /// Returns the validated command (with any clamp warnings) and the
    /// broker's acknowledgement.
    pub async fn submit(
        &self,
        request: CommandRequest,
        source: &str,
    ) -> Result<(ValidatedCommand, PublishAck), BridgeError> {
        let command = self.validator.lock().await.validate(request, source)?;

        if !*self.connectivity.borrow() {
            warn!(
                command = command.request.type_name(),
                source, "command rejected, broker disconnected"
            );
            return Err(BridgeError::NotConnected);
        }

        let qos = qos_for(command.safety_level);

        let payload = serde_json::to_value(&command.request)
            .map_err(|e| BridgeError::Validation(format!("command encoding failed: {e}")))?;
        let ack = self
            .broker
            .publish(CONTROL_TOPIC, payload, qos, false)
            .await?;

        info!(
            command = command.request.type_name(),
            source,
            qos = ack.qos,
            warnings = command.warnings.len(),
            "command dispatched"
        );

        // Echo into the pipeline so the snapshot and viewers observe it. The
        // command has already been delivered; a full intake channel only
        // costs the echo.
        if let Err(e) = self.intake.send(Update::CommandEcho(command.clone())).await {
            warn!(error = %e, "command echo dropped, pipeline gone");
        }

        Ok((command, ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use pourlink_broker::connector::{WireSink, WireStream};
    use pourlink_broker::{BrokerConfig, BrokerConnector, BrokerTransport, Frame};
    use pourlink_validators::RobotLimits;

    #[test]
    fn qos_tracks_safety_level() {
        assert_eq!(qos_for(SafetyLevel::Critical), QoS::ExactlyOnce);
        assert_eq!(qos_for(SafetyLevel::Normal), QoS::AtLeastOnce);
        assert_eq!(qos_for(SafetyLevel::Safe), QoS::AtLeastOnce);
        assert_eq!(qos_for(SafetyLevel::Low), QoS::AtMostOnce);
        assert_eq!(qos_for(SafetyLevel::Blocked), QoS::AtMostOnce);
    }

    struct MockTransport {
        to_test: mpsc::UnboundedSender<String>,
        from_test: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
    }

    impl MockTransport {
        fn pair() -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<String>,
            mpsc::UnboundedSender<String>,
        ) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    to_test: out_tx,
                    from_test: StdMutex::new(Some(in_rx)),
                }),
                out_rx,
                in_tx,
            )
        }
    }

    #[async_trait]
    impl BrokerTransport for MockTransport {
        async fn connect(&self, _url: &str) -> Result<(WireSink, WireStream), BridgeError> {
            let rx = self
                .from_test
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| BridgeError::Transport("no further connections".to_string()))?;
            let tx = self.to_test.clone();
            let sink = futures_util::sink::unfold(tx, |tx, text: String| async move {
                tx.send(text)
                    .map_err(|_| BridgeError::Transport("mock closed".to_string()))?;
                Ok::<_, BridgeError>(tx)
            });
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|text| (Ok(text), rx))
            });
            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }

    fn validator() -> SharedCommandValidator {
        Arc::new(Mutex::new(CommandValidator::new(RobotLimits::default())))
    }

    #[tokio::test]
    async fn valid_command_on_dead_link_reports_not_connected() {
        let (transport, _outbound, _inbound_tx) = MockTransport::pair();
        let (handle, _raw, _conn) =
            BrokerConnector::spawn(BrokerConfig::default(), transport);

        // Gate sees its own connectivity watch, held at `false` here.
        let (_conn_tx, conn_rx) = watch::channel(false);
        let (intake_tx, mut intake_rx) = mpsc::channel(8);
        let gate = CommandGate::new(validator(), handle, intake_tx, conn_rx);

        let result = gate.submit(CommandRequest::EmergencyStop, "api").await;
        assert!(matches!(result, Err(BridgeError::NotConnected)));
        assert!(intake_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_command_on_dead_link_reports_its_real_rejection() {
        let (transport, _outbound, _inbound_tx) = MockTransport::pair();
        let (handle, _raw, _conn) =
            BrokerConnector::spawn(BrokerConfig::default(), transport);

        let (_conn_tx, conn_rx) = watch::channel(false);
        let (intake_tx, _intake_rx) = mpsc::channel(8);
        let gate = CommandGate::new(validator(), handle, intake_tx, conn_rx);

        // Wrong arity: the structural rejection wins over the dead link.
        let result = gate
            .submit(
                CommandRequest::MoveJoint {
                    angles: vec![0.0; 3],
                    speed: None,
                    acceleration: None,
                },
                "api",
            )
            .await;
        assert!(matches!(result, Err(BridgeError::Rejected(_))));
    }

    #[tokio::test]
    async fn stop_goes_out_exactly_once_and_is_echoed() {
        let (transport, mut outbound, inbound_tx) = MockTransport::pair();
        let (handle, _raw, mut conn_rx) =
            BrokerConnector::spawn(BrokerConfig::default(), transport);
        conn_rx.changed().await.unwrap();

        let (intake_tx, mut intake_rx) = mpsc::channel(8);
        let gate = CommandGate::new(validator(), handle, intake_tx, conn_rx);

        let submit =
            tokio::spawn(async move { gate.submit(CommandRequest::Stop, "cockpit").await });

        let text = outbound.recv().await.unwrap();
        let id = match Frame::decode(&text).unwrap() {
            Frame::Publish {
                id: Some(id),
                topic,
                qos: 2,
                ..
            } => {
                assert_eq!(topic, CONTROL_TOPIC);
                id
            }
            other => panic!("expected QoS 2 publish, got {other:?}"),
        };
        inbound_tx
            .send(Frame::Puback { id }.encode().unwrap())
            .unwrap();

        let (command, ack) = submit.await.unwrap().unwrap();
        assert_eq!(command.safety_level, SafetyLevel::Critical);
        assert_eq!(ack.qos, 2);

        match intake_rx.recv().await.unwrap() {
            Update::CommandEcho(echo) => assert_eq!(echo.id, command.id),
            other => panic!("expected command echo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_command_is_rejected_without_publish() {
        let (transport, mut outbound, _inbound_tx) = MockTransport::pair();
        let (handle, _raw, mut conn_rx) =
            BrokerConnector::spawn(BrokerConfig::default(), transport);
        conn_rx.changed().await.unwrap();

        let (intake_tx, _intake_rx) = mpsc::channel(8);
        let gate = CommandGate::new(validator(), handle, intake_tx, conn_rx);

        let result = gate
            .submit(
                CommandRequest::MoveJoint {
                    angles: vec![0.0; 3],
                    speed: None,
                    acceleration: None,
                },
                "api",
            )
            .await;
        assert!(matches!(result, Err(BridgeError::Rejected(_))));
        assert!(outbound.try_recv().is_err());
    }
}
