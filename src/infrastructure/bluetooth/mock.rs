//! Test-friendly in-memory transport.
//!
//! Every accepted submission is recorded on a channel so tests can assert
//! on what reached the "radio" and answer it through a
//! [`TransportSink`](super::transport::TransportSink).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::transport::{LinkHandle, Transport};
use crate::domain::models::{CharacteristicKey, Device};
use crate::error::TransportError;

/// A request that reached the mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    StartScan,
    StopScan,
    Connect {
        address: String,
        link: LinkHandle,
    },
    Disconnect {
        link: LinkHandle,
    },
    DiscoverServices {
        link: LinkHandle,
    },
    Read {
        link: LinkHandle,
        target: CharacteristicKey,
    },
    Write {
        link: LinkHandle,
        target: CharacteristicKey,
        value: Vec<u8>,
        with_response: bool,
    },
    SetNotify {
        link: LinkHandle,
        target: CharacteristicKey,
        enabled: bool,
    },
    DescriptorWrite {
        link: LinkHandle,
        target: CharacteristicKey,
        descriptor: Uuid,
        value: Vec<u8>,
    },
}

/// Switches shared with a [`MockTransport`] after it has been moved into a
/// session.
#[derive(Debug, Clone)]
pub struct MockControls {
    radio_enabled: Arc<AtomicBool>,
    reject: Arc<AtomicBool>,
}

impl MockControls {
    pub fn set_radio_enabled(&self, enabled: bool) {
        self.radio_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make every subsequent submission fail with `TransportError::Rejected`.
    pub fn set_reject_submissions(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    controls: MockControls,
    next_link: u64,
    submissions: mpsc::UnboundedSender<Submission>,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Submission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            controls: MockControls {
                radio_enabled: Arc::new(AtomicBool::new(true)),
                reject: Arc::new(AtomicBool::new(false)),
            },
            next_link: 1,
            submissions: tx,
        };
        (transport, rx)
    }

    pub fn controls(&self) -> MockControls {
        self.controls.clone()
    }

    pub fn set_radio_enabled(&self, enabled: bool) {
        self.controls.set_radio_enabled(enabled);
    }

    fn accept(&self, submission: Submission) -> Result<(), TransportError> {
        if !self.controls.radio_enabled.load(Ordering::SeqCst) {
            return Err(TransportError::RadioUnavailable);
        }
        if self.controls.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("mock rejection".to_string()));
        }
        let _ = self.submissions.send(submission);
        Ok(())
    }
}

impl Transport for MockTransport {
    fn is_radio_enabled(&self) -> bool {
        self.controls.radio_enabled.load(Ordering::SeqCst)
    }

    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.accept(Submission::StartScan)
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        let _ = self.submissions.send(Submission::StopScan);
        Ok(())
    }

    fn submit_connect(&mut self, device: &Device) -> Result<LinkHandle, TransportError> {
        let link = LinkHandle(self.next_link);
        self.accept(Submission::Connect {
            address: device.address.clone(),
            link,
        })?;
        self.next_link += 1;
        Ok(link)
    }

    fn submit_disconnect(&mut self, link: LinkHandle) {
        let _ = self.submissions.send(Submission::Disconnect { link });
    }

    fn submit_discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError> {
        self.accept(Submission::DiscoverServices { link })
    }

    fn submit_read(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
    ) -> Result<(), TransportError> {
        self.accept(Submission::Read {
            link,
            target: *target,
        })
    }

    fn submit_write(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        self.accept(Submission::Write {
            link,
            target: *target,
            value: value.to_vec(),
            with_response,
        })
    }

    fn submit_set_notify(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.accept(Submission::SetNotify {
            link,
            target: *target,
            enabled,
        })
    }

    fn submit_descriptor_write(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.accept(Submission::DescriptorWrite {
            link,
            target: *target,
            descriptor,
            value: value.to_vec(),
        })
    }
}
