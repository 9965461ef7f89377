//! In-memory BLE transport and a simulated Legacy DFU bootloader.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::dfu_uuids::*;
use crate::transport::{
    BleLink, BleTransport, DisconnectObserver, NotifyFn, PeerAddress, PeripheralIdentity, WriteMode,
};

/// Gap between two notifications handed to the subscriber.
const DELIVERY_GAP: Duration = Duration::from_millis(1);

/// How a fake peripheral reacts to one write.
pub enum Reaction {
    Notify(Vec<Vec<u8>>),
    Fail(TransportError),
    /// Drop the link, as a peripheral rebooting on this write would.
    Reboot,
}

pub trait Responder: Send {
    fn on_write(&mut self, chr: Uuid, bytes: &[u8]) -> Reaction;
}

struct Scripted<F>(F);

impl<F> Responder for Scripted<F>
where
    F: FnMut(Uuid, &[u8]) -> Result<Vec<Vec<u8>>, TransportError> + Send,
{
    fn on_write(&mut self, chr: Uuid, bytes: &[u8]) -> Reaction {
        match (self.0)(chr, bytes) {
            Ok(n) => Reaction::Notify(n),
            Err(e) => Reaction::Fail(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub chr: Uuid,
    pub bytes: Vec<u8>,
    pub mode: WriteMode,
}

struct LinkState {
    observer: DisconnectObserver,
    connected: AtomicBool,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    version: Option<Vec<u8>>,
    writes: Mutex<Vec<Written>>,
    subscriptions: Mutex<Vec<Uuid>>,
    responder: Mutex<Box<dyn Responder>>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    disconnects: AtomicUsize,
}

/// Fake GATT link. Clones share state.
#[derive(Clone)]
pub struct FakeLink {
    state: Arc<LinkState>,
}

/// What a fake peripheral exposes once connected.
pub struct LinkSpec {
    pub services: Vec<Uuid>,
    pub characteristics: Vec<Uuid>,
    pub version: Option<Vec<u8>>,
    pub responder: Box<dyn Responder>,
}

impl LinkSpec {
    pub fn bootloader(sim: SimulatedBootloader) -> Self {
        LinkSpec {
            services: vec![SERVICE],
            characteristics: vec![CTRL_PT, PACKET, VERSION],
            version: Some(vec![0x06, 0x01]),
            responder: Box::new(sim),
        }
    }

    /// Application firmware exposing the buttonless trigger.
    pub fn buttonless_app(responder: impl Responder + 'static) -> Self {
        LinkSpec {
            services: vec![Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB)],
            characteristics: vec![BTTNLSS],
            version: None,
            responder: Box::new(responder),
        }
    }

    /// Application firmware that still carries the Legacy DFU service.
    pub fn legacy_app(responder: impl Responder + 'static) -> Self {
        LinkSpec {
            services: vec![SERVICE],
            characteristics: vec![CTRL_PT, PACKET],
            version: None,
            responder: Box::new(responder),
        }
    }

    /// Application firmware without any DFU entry point.
    pub fn plain_app() -> Self {
        LinkSpec {
            services: vec![],
            characteristics: vec![],
            version: None,
            responder: Box::new(Scripted(
                |_: Uuid, _: &[u8]| -> Result<Vec<Vec<u8>>, TransportError> { Ok(vec![]) },
            )),
        }
    }
}

impl FakeLink {
    pub fn new(spec: LinkSpec, observer: DisconnectObserver) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        FakeLink {
            state: Arc::new(LinkState {
                observer,
                connected: AtomicBool::new(true),
                services: spec.services,
                characteristics: spec.characteristics,
                version: spec.version,
                writes: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                responder: Mutex::new(spec.responder),
                outbox,
                inbox: Mutex::new(Some(inbox)),
                disconnects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn scripted<F>(f: F) -> Self
    where
        F: FnMut(Uuid, &[u8]) -> Result<Vec<Vec<u8>>, TransportError> + Send + 'static,
    {
        let spec = LinkSpec {
            services: vec![SERVICE],
            characteristics: vec![CTRL_PT, PACKET, VERSION],
            version: Some(vec![0x06, 0x01]),
            responder: Box::new(Scripted(f)),
        };
        Self::new(spec, DisconnectObserver::new())
    }

    pub fn writes(&self) -> Vec<Written> {
        self.state.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.state.writes.lock().unwrap().clear();
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    /// Queue a notification as if the peripheral had sent it.
    pub fn inject(&self, bytes: Vec<u8>) {
        let _ = self.state.outbox.send(bytes);
    }

    /// Simulate the peer going away.
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.observer.notify_disconnected();
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }
}

pub fn bootloader_link(sim: SimulatedBootloader) -> FakeLink {
    FakeLink::new(LinkSpec::bootloader(sim), DisconnectObserver::new())
}

#[async_trait]
impl BleLink for FakeLink {
    fn observer(&self) -> &DisconnectObserver {
        &self.state.observer
    }

    async fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn services(&self) -> Vec<Uuid> {
        self.state.services.clone()
    }

    fn has_characteristic(&self, chr: Uuid) -> bool {
        self.state.characteristics.contains(&chr)
    }

    async fn read(&self, chr: Uuid) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected().await {
            return Err(TransportError::disconnected("not connected"));
        }
        match (chr == VERSION, &self.state.version) {
            (true, Some(v)) => Ok(v.clone()),
            _ => Err(TransportError::not_found(format!("characteristic {chr}"))),
        }
    }

    async fn write(&self, chr: Uuid, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        if !self.is_connected().await {
            return Err(TransportError::disconnected("not connected"));
        }
        self.state.writes.lock().unwrap().push(Written {
            chr,
            bytes: bytes.to_vec(),
            mode,
        });
        let reaction = self.state.responder.lock().unwrap().on_write(chr, bytes);
        match reaction {
            Reaction::Notify(notifications) => {
                for n in notifications {
                    self.inject(n);
                }
                Ok(())
            }
            Reaction::Fail(e) => Err(e),
            Reaction::Reboot => {
                self.drop_link();
                Err(TransportError::disconnected("peer rebooted"))
            }
        }
    }

    async fn subscribe(&self, chr: Uuid, on_notify: NotifyFn) -> Result<(), TransportError> {
        self.state.subscriptions.lock().unwrap().push(chr);
        let inbox = self.state.inbox.lock().unwrap().take();
        if let Some(mut inbox) = inbox {
            tokio::spawn(async move {
                while let Some(bytes) = inbox.recv().await {
                    on_notify(bytes);
                    tokio::time::sleep(DELIVERY_GAP).await;
                }
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Outcome of one `connect` call on the fake transport.
pub enum ConnectPlan {
    Accept(LinkSpec),
    /// Connect returns a link whose peer is already gone.
    DropImmediately(LinkSpec),
    Refuse(TransportError),
    /// Connect never returns.
    Hang,
}

/// Fake central with scripted scan rounds and connection outcomes.
#[derive(Default)]
pub struct FakeTransport {
    rounds: Mutex<VecDeque<Vec<PeripheralIdentity>>>,
    /// Returned once `rounds` runs dry.
    steady: Mutex<Vec<PeripheralIdentity>>,
    plans: Mutex<VecDeque<ConnectPlan>>,
    scans: AtomicUsize,
    connects: Mutex<Vec<PeripheralIdentity>>,
    links: Mutex<Vec<FakeLink>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_round(self, round: Vec<PeripheralIdentity>) -> Self {
        self.rounds.lock().unwrap().push_back(round);
        self
    }

    pub fn with_steady(self, seen: Vec<PeripheralIdentity>) -> Self {
        *self.steady.lock().unwrap() = seen;
        self
    }

    pub fn with_plan(self, plan: ConnectPlan) -> Self {
        self.plans.lock().unwrap().push_back(plan);
        self
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> Vec<PeripheralIdentity> {
        self.connects.lock().unwrap().clone()
    }

    pub fn links(&self) -> Vec<FakeLink> {
        self.links.lock().unwrap().clone()
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    type Link = FakeLink;

    async fn scan(&self, duration: Duration) -> Result<Vec<PeripheralIdentity>, TransportError> {
        tokio::time::sleep(duration).await;
        self.scans.fetch_add(1, Ordering::SeqCst);
        let next = self.rounds.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.steady.lock().unwrap().clone()))
    }

    async fn connect(
        &self,
        peer: &PeripheralIdentity,
        _timeout: Duration,
        observer: DisconnectObserver,
    ) -> Result<FakeLink, TransportError> {
        self.connects.lock().unwrap().push(peer.clone());
        let plan = self.plans.lock().unwrap().pop_front();
        let link = match plan {
            Some(ConnectPlan::Accept(spec)) => FakeLink::new(spec, observer),
            Some(ConnectPlan::DropImmediately(spec)) => {
                let link = FakeLink::new(spec, observer);
                link.drop_link();
                link
            }
            Some(ConnectPlan::Refuse(e)) => return Err(e),
            Some(ConnectPlan::Hang) => {
                std::future::pending::<()>().await;
                return Err(TransportError::timeout("connect never completed"));
            }
            None => return Err(TransportError::timeout("no connection plan left")),
        };
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

/// Peripheral seen by a scan.
pub fn seen(address: &str, name: Option<&str>, services: Vec<Uuid>) -> PeripheralIdentity {
    PeripheralIdentity::new(PeerAddress::parse(address), name.map(str::to_string), services)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimState {
    #[default]
    Idle,
    AwaitingSizes,
    ReceivingInit,
    Receiving,
}

/// Answers Legacy DFU frames like a Nordic bootloader.
pub struct SimulatedBootloader {
    pub start_status: u8,
    pub init_status: u8,
    pub transfer_status: u8,
    pub validate_status: u8,
    pub send_receipts: bool,
    pub send_completion: bool,
    /// Emit one extra receipt right before the completion response.
    pub trailing_receipt: bool,
    pub activate_error: Option<TransportError>,
    pub state: SimState,
    pub prn: u16,
    pub image_size: usize,
    pub received: usize,
    pub packets: usize,
}

impl Default for SimulatedBootloader {
    fn default() -> Self {
        SimulatedBootloader {
            start_status: 0x01,
            init_status: 0x01,
            transfer_status: 0x01,
            validate_status: 0x01,
            send_receipts: true,
            send_completion: true,
            trailing_receipt: false,
            activate_error: None,
            state: SimState::Idle,
            prn: 0,
            image_size: 0,
            received: 0,
            packets: 0,
        }
    }
}

impl SimulatedBootloader {
    fn receipt(&self) -> Vec<u8> {
        let mut n = vec![0x11];
        n.extend_from_slice(&(self.received as u32).to_le_bytes());
        n
    }

    fn on_control(&mut self, bytes: &[u8]) -> Reaction {
        match bytes.first() {
            Some(0x01) => {
                self.state = SimState::AwaitingSizes;
                Reaction::Notify(vec![])
            }
            Some(0x02) if bytes.get(1) == Some(&0x00) => {
                self.state = SimState::ReceivingInit;
                Reaction::Notify(vec![])
            }
            Some(0x02) => {
                self.state = SimState::Idle;
                Reaction::Notify(vec![vec![0x10, 0x02, self.init_status]])
            }
            Some(0x08) => {
                self.prn = u16::from_le_bytes([bytes[1], bytes[2]]);
                Reaction::Notify(vec![])
            }
            Some(0x03) => {
                self.state = SimState::Receiving;
                self.received = 0;
                self.packets = 0;
                Reaction::Notify(vec![])
            }
            Some(0x04) => Reaction::Notify(vec![vec![0x10, 0x04, self.validate_status]]),
            Some(0x05) => match self.activate_error.take() {
                Some(e) => Reaction::Fail(e),
                None => Reaction::Reboot,
            },
            _ => Reaction::Notify(vec![]),
        }
    }

    fn on_packet(&mut self, bytes: &[u8]) -> Reaction {
        match self.state {
            SimState::AwaitingSizes => {
                self.image_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
                self.state = SimState::Idle;
                Reaction::Notify(vec![vec![0x10, 0x01, self.start_status]])
            }
            SimState::ReceivingInit => Reaction::Notify(vec![]),
            SimState::Receiving => {
                self.received += bytes.len();
                self.packets += 1;
                let mut out = Vec::new();
                let at_boundary = self.prn > 0 && self.packets % self.prn as usize == 0;
                if self.send_receipts && at_boundary {
                    out.push(self.receipt());
                }
                if self.received >= self.image_size {
                    self.state = SimState::Idle;
                    if self.trailing_receipt && !at_boundary {
                        out.push(self.receipt());
                    }
                    if self.send_completion {
                        out.push(vec![0x10, 0x03, self.transfer_status]);
                    }
                }
                Reaction::Notify(out)
            }
            SimState::Idle => Reaction::Notify(vec![]),
        }
    }
}

impl Responder for SimulatedBootloader {
    fn on_write(&mut self, chr: Uuid, bytes: &[u8]) -> Reaction {
        if chr == CTRL_PT {
            self.on_control(bytes)
        } else if chr == PACKET {
            self.on_packet(bytes)
        } else {
            Reaction::Notify(vec![])
        }
    }
}

/// Application firmware that reboots on any write to its trigger.
pub struct RebootOnWrite;

impl Responder for RebootOnWrite {
    fn on_write(&mut self, _chr: Uuid, _bytes: &[u8]) -> Reaction {
        Reaction::Reboot
    }
}

/// Application firmware that refuses the trigger with a GATT error.
pub struct RejectWrites;

impl Responder for RejectWrites {
    fn on_write(&mut self, _chr: Uuid, _bytes: &[u8]) -> Reaction {
        Reaction::Fail(TransportError::other("GATT write not permitted"))
    }
}
