//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use bridge_hub::Message;
use bridge_session::{
    Connector, IoStream, Listener, MemoryListener, MemoryNetwork, PipeAddress, Session,
    SessionConfig, SessionError, SessionEvent, SessionHandle,
};
use bridge_wire::{ControlMessage, Frame, FrameKind};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::registry::ControlSink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alpha {
    pub value: u64,
}

impl Message for Alpha {
    const TYPE_ID: &'static str = "test.Alpha";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beta {
    pub value: u64,
}

impl Message for Beta {
    const TYPE_ID: &'static str = "test.Beta";
}

/// Control sink that records what it is asked to send
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<ControlMessage>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    pub fn take(&self) -> Vec<ControlMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl ControlSink for RecordingSink {
    fn send_control(&self, message: &ControlMessage) -> Result<(), SessionError> {
        if self.fail {
            return Err(SessionError::Closed);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Memory connector that timestamps every attempt
#[derive(Clone)]
pub struct RecordingConnector {
    network: MemoryNetwork,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl RecordingConnector {
    pub fn new(network: &MemoryNetwork) -> Self {
        Self {
            network: network.clone(),
            attempts: Arc::default(),
        }
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, address: &PipeAddress) -> io::Result<IoStream> {
        self.attempts.lock().unwrap().push(Instant::now());
        self.network.connector().connect(address).await
    }
}

/// Bare peer that exposes raw frames
pub struct TestPeer {
    listener: MemoryListener,
}

impl TestPeer {
    pub fn bind(network: &MemoryNetwork, address: &PipeAddress) -> Self {
        Self {
            listener: network.bind(address.clone()).unwrap(),
        }
    }

    pub async fn accept(&mut self) -> PeerConnection {
        let stream = tokio::time::timeout(Duration::from_secs(30), self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let session = Session::spawn(stream, SessionConfig::default(), tx);
        PeerConnection { session, events }
    }
}

/// One accepted client as seen by a [`TestPeer`]
pub struct PeerConnection {
    pub session: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl PeerConnection {
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), self.events.recv())
                .await
                .expect("no frame from client")
                .expect("client session ended");
            if let SessionEvent::Frame(frame) = event {
                return frame;
            }
        }
    }

    pub async fn next_control(&mut self) -> ControlMessage {
        ControlMessage::try_from(self.next_frame().await).expect("expected a control frame")
    }

    /// Frames already received, without waiting
    pub fn drain_controls(&mut self) -> Vec<ControlMessage> {
        let mut controls = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let SessionEvent::Frame(frame) = event {
                if frame.kind != FrameKind::Message {
                    controls.push(ControlMessage::try_from(frame).unwrap());
                }
            }
        }
        controls
    }

    pub fn send_message<M: Message>(&self, message: &M) {
        let payload = bridge_wire::encode_payload(message).unwrap();
        self.session
            .send_frame(&Frame::message(M::TYPE_ID, payload))
            .unwrap();
    }
}

/// Let spawned tasks run until they are all idle
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
