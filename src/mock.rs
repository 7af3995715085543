//! Scripted in-memory transport for tests and hardware-free development.
//!
//! By default it reproduces the Muse S enumeration quirk: the first link of a
//! session only exposes the control channel, every later link exposes the
//! full sensor set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::{MuseError, Result};
use crate::protocol::{Channel, Electrode, NOTIFICATION_LEN};
use crate::transport::{Link, NotificationStream, Transport};
use crate::types::NotificationFragment;

#[derive(Default)]
struct MockState {
    devices: Vec<String>,
    /// Channel sets handed out by successive connects; the last one repeats.
    channel_sets: Vec<Vec<Channel>>,
    connects: usize,
    disconnects: usize,
    fail_connects: usize,
    fail_writes: usize,
    fail_subscribes: usize,
    /// Failures injected into one link only, keyed by link index.
    link_write_failures: HashMap<usize, usize>,
    link_subscribe_failures: HashMap<usize, usize>,
    writes: Vec<(usize, Channel, Vec<u8>)>,
    subscriptions: Vec<(usize, Channel)>,
    senders: Vec<Option<mpsc::UnboundedSender<NotificationFragment>>>,
    /// Control responses sent back when a command token is written.
    responses: HashMap<String, String>,
}

/// In-memory [`Transport`].  Clones share state, so a test can keep one clone
/// to inspect and drive the transport handed to a session.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Every channel a phase-two Muse S link exposes.
pub fn full_channel_set() -> Vec<Channel> {
    let mut set = Channel::REQUIRED.to_vec();
    set.extend(Electrode::AUXILIARY.iter().map(|&e| Channel::Eeg(e)));
    set
}

/// Split `json` into 20-byte control notifications with junk padding.
pub fn control_fragments(json: &str) -> Vec<Vec<u8>> {
    json.as_bytes()
        .chunks(NOTIFICATION_LEN - 1)
        .map(|chunk| {
            let mut f = Vec::with_capacity(NOTIFICATION_LEN);
            f.push(chunk.len() as u8);
            f.extend_from_slice(chunk);
            f.resize(NOTIFICATION_LEN, b'}');
            f
        })
        .collect()
}

impl MockTransport {
    /// A single Muse S at `"00:55:DA:B3:81:73"` with the two-step enumeration.
    pub fn muse_s() -> Self {
        Self::with_channel_sets(vec![vec![Channel::Control], full_channel_set()])
    }

    pub fn with_channel_sets(channel_sets: Vec<Vec<Channel>>) -> Self {
        let t = Self::default();
        {
            let mut s = t.lock();
            s.devices = vec!["00:55:DA:B3:81:73".into()];
            s.channel_sets = channel_sets;
        }
        t
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.lock().fail_subscribes = n;
    }

    /// Fail the next `n` writes made on link `link` (0-based).
    pub fn fail_writes_on_link(&self, link: usize, n: usize) {
        self.lock().link_write_failures.insert(link, n);
    }

    /// Fail the next `n` subscribes made on link `link` (0-based).
    pub fn fail_subscribes_on_link(&self, link: usize, n: usize) {
        self.lock().link_subscribe_failures.insert(link, n);
    }

    /// Answer every write of `token` with `json` on the control channel.
    pub fn respond_to(&self, token: &str, json: &str) {
        self.lock().responses.insert(token.into(), json.into());
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    /// Command tokens written to the control channel of link `link` (0-based).
    pub fn commands_on(&self, link: usize) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .filter(|(l, ch, _)| *l == link && *ch == Channel::Control)
            .map(|(_, _, bytes)| decode_frame(bytes))
            .collect()
    }

    /// Every command token written, across all links.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .filter(|(_, ch, _)| *ch == Channel::Control)
            .map(|(_, _, bytes)| decode_frame(bytes))
            .collect()
    }

    pub fn subscriptions_on(&self, link: usize) -> Vec<Channel> {
        self.lock()
            .subscriptions
            .iter()
            .filter(|(l, _)| *l == link)
            .map(|(_, ch)| *ch)
            .collect()
    }

    /// Push a notification into the most recent link.  Returns `false` when
    /// that link is closed.
    pub fn notify(&self, channel: Channel, data: Vec<u8>) -> bool {
        let s = self.lock();
        match s.senders.last() {
            Some(Some(tx)) => tx.send(NotificationFragment::new(channel, data)).is_ok(),
            _ => false,
        }
    }

    /// Simulate the headset dropping the most recent link.
    pub fn drop_link(&self) {
        if let Some(slot) = self.lock().senders.last_mut() {
            slot.take();
        }
    }
}

/// Strip the length byte and trailing newline from a written command.
fn decode_frame(bytes: &[u8]) -> String {
    if bytes.len() < 2 {
        return String::new();
    }
    String::from_utf8_lossy(&bytes[1..bytes.len() - 1]).into_owned()
}

fn take_failure(failures: &mut HashMap<usize, usize>, link: usize) -> bool {
    match failures.get_mut(&link) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn discover(&self, _timeout: Duration) -> Result<Vec<String>> {
        Ok(self.lock().devices.clone())
    }

    async fn connect(&self, address: &str) -> Result<MockLink> {
        let mut s = self.lock();
        if !s.devices.iter().any(|d| d == address) {
            return Err(MuseError::Transport(format!("device {address} not found")));
        }
        if s.fail_connects > 0 {
            s.fail_connects -= 1;
            return Err(MuseError::Transport("connect refused".into()));
        }
        let index = s.connects;
        s.connects += 1;
        let channels = s
            .channel_sets
            .get(index)
            .or_else(|| s.channel_sets.last())
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        s.senders.push(Some(tx));
        Ok(MockLink {
            index,
            channels,
            transport: self.clone(),
            rx: Mutex::new(Some(rx)),
        })
    }
}

/// One link handed out by [`MockTransport`].
pub struct MockLink {
    index: usize,
    channels: Vec<Channel>,
    transport: MockTransport,
    rx: Mutex<Option<mpsc::UnboundedReceiver<NotificationFragment>>>,
}

#[async_trait]
impl Link for MockLink {
    fn channels(&self) -> Vec<Channel> {
        self.channels.clone()
    }

    async fn subscribe(&self, channel: Channel) -> Result<()> {
        let mut s = self.transport.lock();
        if s.fail_subscribes > 0 {
            s.fail_subscribes -= 1;
            return Err(MuseError::Transport("subscribe failed".into()));
        }
        if take_failure(&mut s.link_subscribe_failures, self.index) {
            return Err(MuseError::Transport("subscribe failed".into()));
        }
        if !self.channels.contains(&channel) {
            return Err(MuseError::Transport(format!("{channel} not available")));
        }
        s.subscriptions.push((self.index, channel));
        Ok(())
    }

    async fn write(&self, channel: Channel, data: &[u8], _ack_required: bool) -> Result<()> {
        let mut s = self.transport.lock();
        if s.fail_writes > 0 {
            s.fail_writes -= 1;
            return Err(MuseError::Transport("write failed".into()));
        }
        if take_failure(&mut s.link_write_failures, self.index) {
            return Err(MuseError::Transport("write failed".into()));
        }
        s.writes.push((self.index, channel, data.to_vec()));
        if channel == Channel::Control {
            let token = decode_frame(data);
            if let Some(json) = s.responses.get(&token).cloned() {
                if let Some(Some(tx)) = s.senders.get(self.index) {
                    for f in control_fragments(&json) {
                        let _ = tx.send(NotificationFragment::new(Channel::Control, f));
                    }
                }
            }
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| MuseError::Transport("notification stream already taken".into()))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|f| (f, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut s = self.transport.lock();
        s.disconnects += 1;
        if let Some(slot) = s.senders.get_mut(self.index) {
            slot.take();
        }
        Ok(())
    }
}
