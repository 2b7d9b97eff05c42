//! mDNS browsing with `mdns-sd`.
//!
//! One daemon serves every browsed service type.  Each browse gets a small
//! forwarder thread that turns `ServiceResolved` events into
//! [`Advertisement`]s on a single channel.  Shutting the daemon down closes
//! its event channels, which ends the forwarders and in turn disconnects the
//! receiver handed to the engine.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::discover_devices::{Advertisement, DiscoveryError, ServiceBrowser};

#[derive(Debug, Error)]
pub enum BrowseError {
    #[error("cannot start mDNS daemon: {0}")]
    Daemon(#[source] mdns_sd::Error),
    #[error("cannot browse {service_type}: {source}")]
    Browse {
        service_type: String,
        #[source]
        source: mdns_sd::Error,
    },
    #[error("failed to spawn mDNS forwarder: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<BrowseError> for DiscoveryError {
    fn from(e: BrowseError) -> Self {
        DiscoveryError::Browse(e.to_string())
    }
}

/// Builds an advertisement from a resolved record.  Falls back to the
/// instance label when the record has no host name.
pub fn advertisement_from(
    hostname: &str,
    fullname: &str,
    addresses: impl IntoIterator<Item = IpAddr>,
) -> Advertisement {
    let hostname = if hostname.trim().is_empty() {
        fullname.split('.').next().unwrap_or_default().to_string()
    } else {
        hostname.to_string()
    };
    let sorted: BTreeSet<IpAddr> = addresses.into_iter().collect();
    Advertisement {
        hostname,
        addresses: sorted.into_iter().collect(),
    }
}

/// [`ServiceBrowser`] backed by an `mdns-sd` daemon.
#[derive(Default)]
pub struct MdnsBrowser {
    daemon: Mutex<Option<ServiceDaemon>>,
}

impl MdnsBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_daemon(&self, service_types: &[&str]) -> Result<Receiver<Advertisement>, BrowseError> {
        let daemon = ServiceDaemon::new().map_err(BrowseError::Daemon)?;
        let (tx, rx) = mpsc::channel();

        for service_type in service_types {
            let events = daemon
                .browse(service_type)
                .map_err(|source| BrowseError::Browse {
                    service_type: service_type.to_string(),
                    source,
                });
            let events = match events {
                Ok(events) => events,
                Err(e) => {
                    shutdown(&daemon);
                    return Err(e);
                }
            };
            let tx: Sender<Advertisement> = tx.clone();
            let label = service_type.trim_end_matches('.').to_string();
            let spawned = thread::Builder::new()
                .name(format!("bjorn-mdns-{label}"))
                .spawn(move || {
                    while let Ok(event) = events.recv() {
                        if let ServiceEvent::ServiceResolved(info) = event {
                            let ad = advertisement_from(
                                info.get_hostname(),
                                info.get_fullname(),
                                info.get_addresses().iter().copied(),
                            );
                            debug!("mDNS {label}: {} {:?}", ad.hostname, ad.addresses);
                            if tx.send(ad).is_err() {
                                break;
                            }
                        }
                    }
                    debug!("mDNS forwarder for {label} stopped");
                });
            if let Err(e) = spawned {
                shutdown(&daemon);
                return Err(BrowseError::Spawn(e));
            }
        }

        info!("browsing mDNS for {}", service_types.join(", "));
        *self.daemon.lock().unwrap_or_else(PoisonError::into_inner) = Some(daemon);
        Ok(rx)
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn start(&self, service_types: &[&str]) -> Result<Receiver<Advertisement>, DiscoveryError> {
        self.stop();
        Ok(self.start_daemon(service_types)?)
    }

    fn stop(&self) {
        let daemon = self.daemon.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(daemon) = daemon {
            shutdown(&daemon);
        }
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        self.stop();
    }
}

fn shutdown(daemon: &ServiceDaemon) {
    if let Err(e) = daemon.shutdown() {
        warn!("mDNS daemon shutdown failed: {e}");
    }
}
