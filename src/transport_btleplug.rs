use crate::config::GATT_OP_TIMEOUT;
use crate::error::TransportError;
use crate::transport::{BleLink, BleTransport, DisconnectObserver, NotifyFn, PeerAddress, PeripheralIdentity, WriteMode};

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

async fn timeout<F: std::future::Future>(what: &str, future: F) -> Result<F::Output, TransportError> {
    tokio::time::timeout(GATT_OP_TIMEOUT, future)
        .await
        .map_err(|_| TransportError::timeout(format!("{what} timed out after {GATT_OP_TIMEOUT:?}")))
}

fn address_of(peripheral: &Peripheral, props: &PeripheralProperties) -> PeerAddress {
    // CoreBluetooth hides hardware addresses and reports all zeroes
    if props.address == BDAddr::default() {
        PeerAddress::Platform(peripheral.id().to_string())
    } else {
        PeerAddress::Hardware(props.address.into_inner())
    }
}

fn identity_of(peripheral: &Peripheral, props: &PeripheralProperties) -> PeripheralIdentity {
    PeripheralIdentity::new(address_of(peripheral, props), props.local_name.clone(), props.services.clone())
}

/// Central backed by the first adapter btleplug reports.
pub struct BtleplugTransport {
    central: Adapter,
}

impl BtleplugTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = btleplug::platform::Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::not_found("no Bluetooth adapter available"))?;
        Ok(BtleplugTransport { central })
    }

    async fn peripheral_at(&self, address: &PeerAddress) -> Result<Peripheral, TransportError> {
        for peripheral in self.central.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if address_of(&peripheral, &props) == *address {
                    return Ok(peripheral);
                }
            }
        }
        Err(TransportError::not_found(format!("peripheral {address} is not known to the adapter")))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn scan(&self, duration: Duration) -> Result<Vec<PeripheralIdentity>, TransportError> {
        let mut events = self.central.events().await?;
        self.central.start_scan(ScanFilter::default()).await?;

        let mut observed: Vec<PeripheralId> = Vec::new();
        let window = tokio::time::sleep(duration);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id))
                    | Some(CentralEvent::ServicesAdvertisement { id, .. })
                    | Some(CentralEvent::ServiceDataAdvertisement { id, .. })
                    | Some(CentralEvent::ManufacturerDataAdvertisement { id, .. }) => {
                        if !observed.contains(&id) {
                            observed.push(id);
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        self.central.stop_scan().await?;

        let mut seen = Vec::with_capacity(observed.len());
        for id in observed {
            let peripheral = self.central.peripheral(&id).await?;
            if let Some(props) = peripheral.properties().await? {
                seen.push(identity_of(&peripheral, &props));
            }
        }
        debug!("scan saw {} peripherals", seen.len());
        Ok(seen)
    }

    async fn connect(
        &self,
        peer: &PeripheralIdentity,
        timeout_after: Duration,
        observer: DisconnectObserver,
    ) -> Result<BtleplugLink, TransportError> {
        let peripheral = self.peripheral_at(&peer.address).await?;

        // watch for the drop before connecting so an immediate one is not missed
        let id = peripheral.id();
        let mut events = self.central.events().await?;
        let flag = observer.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        debug!("peripheral {} disconnected", gone);
                        flag.notify_disconnected();
                        break;
                    }
                }
            }
        });

        let link = BtleplugLink {
            peripheral,
            observer,
            tasks: Mutex::new(vec![watcher]),
            closed: AtomicBool::new(false),
        };
        tokio::time::timeout(timeout_after, link.peripheral.connect())
            .await
            .map_err(|_| TransportError::timeout(format!("connect to {} timed out", peer.address)))??;
        timeout("service discovery", link.peripheral.discover_services()).await??;
        Ok(link)
    }
}

/// Open GATT connection to one peripheral.
pub struct BtleplugLink {
    peripheral: Peripheral,
    observer: DisconnectObserver,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::not_found(format!("characteristic {uuid}")))
    }

    /// Backends report a vanished peer in many ways; once the link is down
    /// every failure is a disconnect.
    async fn classify(&self, err: btleplug::Error) -> TransportError {
        let err = TransportError::from(err);
        if !err.is_disconnect() && !self.is_connected().await {
            return TransportError::disconnected(err.to_string());
        }
        err
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn observer(&self) -> &DisconnectObserver {
        &self.observer
    }

    async fn is_connected(&self) -> bool {
        !self.observer.is_disconnected() && self.peripheral.is_connected().await.unwrap_or(false)
    }

    fn services(&self) -> Vec<Uuid> {
        self.peripheral.services().iter().map(|s| s.uuid).collect()
    }

    fn has_characteristic(&self, chr: Uuid) -> bool {
        self.peripheral.characteristics().iter().any(|c| c.uuid == chr)
    }

    async fn read(&self, chr: Uuid) -> Result<Vec<u8>, TransportError> {
        let chr = self.characteristic(chr)?;
        match timeout("read", self.peripheral.read(&chr)).await? {
            Ok(value) => Ok(value),
            Err(e) => Err(self.classify(e).await),
        }
    }

    async fn write(&self, chr: Uuid, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        let chr = self.characteristic(chr)?;
        let write_type = match mode {
            WriteMode::Acknowledged => WriteType::WithResponse,
            WriteMode::Unacknowledged => WriteType::WithoutResponse,
        };
        match timeout("write", self.peripheral.write(&chr, bytes, write_type)).await? {
            Ok(()) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    async fn subscribe(&self, chr: Uuid, on_notify: NotifyFn) -> Result<(), TransportError> {
        let characteristic = self.characteristic(chr)?;
        let mut notifications = match self.peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.classify(e).await),
        };
        if let Err(e) = timeout("subscribe", self.peripheral.subscribe(&characteristic)).await? {
            return Err(self.classify(e).await);
        }
        let forwarder = tokio::spawn(async move {
            while let Some(ntf) = notifications.next().await {
                if ntf.uuid == chr {
                    on_notify(ntf.value);
                }
            }
        });
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(forwarder);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        timeout("disconnect", self.peripheral.disconnect()).await??;
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        let tasks = std::mem::take(self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        // a link abandoned mid-session (cancellation) must not stay open
        if !self.closed.load(Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let peripheral = self.peripheral.clone();
                handle.spawn(async move {
                    let _ = peripheral.disconnect().await;
                });
            }
        }
    }
}
