//! Tracks the published status of client certificates
//!
//! A client certificate may name a PV that publishes whether it is still valid.
//! Connections authenticated by such a certificate watch that status. They have
//! anonymous access while it is anything but valid, and get their certificate
//! identity back once it is valid again.

use std::{collections::HashMap, fmt, str::FromStr, sync::Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CertificateStatus {
    /// No status received yet
    #[default]
    Unknown,
    Valid,
    Pending,
    PendingApproval,
    PendingRenewal,
    Expired,
    Revoked,
}

impl CertificateStatus {
    /// Only a confirmed valid certificate may be used for authentication
    pub fn is_valid(self) -> bool {
        self == CertificateStatus::Valid
    }
}

impl FromStr for CertificateStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => CertificateStatus::Unknown,
            "VALID" => CertificateStatus::Valid,
            "PENDING" => CertificateStatus::Pending,
            "PENDING_APPROVAL" => CertificateStatus::PendingApproval,
            "PENDING_RENEWAL" => CertificateStatus::PendingRenewal,
            "EXPIRED" => CertificateStatus::Expired,
            "REVOKED" => CertificateStatus::Revoked,
            other => return Err(format!("Unknown certificate status '{other}'")),
        })
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateStatus::Unknown => "UNKNOWN",
            CertificateStatus::Valid => "VALID",
            CertificateStatus::Pending => "PENDING",
            CertificateStatus::PendingApproval => "PENDING_APPROVAL",
            CertificateStatus::PendingRenewal => "PENDING_RENEWAL",
            CertificateStatus::Expired => "EXPIRED",
            CertificateStatus::Revoked => "REVOKED",
        };
        f.write_str(name)
    }
}

/// Latest known status per status PV name
///
/// A name is forgotten once nobody watches it any more and its status is unknown.
#[derive(Debug, Default)]
pub struct CertificateStatusMonitor {
    states: Mutex<HashMap<String, watch::Sender<CertificateStatus>>>,
}

impl CertificateStatusMonitor {
    pub fn new() -> Self {
        CertificateStatusMonitor::default()
    }

    /// Watch the status published under `status_pv`
    pub fn subscribe(&self, status_pv: &str) -> watch::Receiver<CertificateStatus> {
        let mut states = self.states.lock().unwrap();
        prune(&mut states);
        states
            .entry(status_pv.to_string())
            .or_insert_with(|| {
                debug!("Starting to track certificate status {status_pv}");
                watch::channel(CertificateStatus::Unknown).0
            })
            .subscribe()
    }

    /// Publish a new status, notifying every connection that watches it
    pub fn set_status(&self, status_pv: &str, status: CertificateStatus) {
        let mut states = self.states.lock().unwrap();
        prune(&mut states);
        let sender = states
            .entry(status_pv.to_string())
            .or_insert_with(|| watch::channel(CertificateStatus::Unknown).0);
        let previous = sender.send_replace(status);
        if previous != status {
            info!("Certificate status {status_pv}: {previous} -> {status}");
        }
    }

    pub fn status(&self, status_pv: &str) -> CertificateStatus {
        self.states
            .lock()
            .unwrap()
            .get(status_pv)
            .map(|s| *s.borrow())
            .unwrap_or_default()
    }

    /// Number of status PVs currently tracked
    pub fn tracked(&self) -> usize {
        let mut states = self.states.lock().unwrap();
        prune(&mut states);
        states.len()
    }
}

/// Drop unwatched entries. Known statuses are kept for connections still to come.
fn prune(states: &mut HashMap<String, watch::Sender<CertificateStatus>>) {
    states.retain(|name, sender| {
        let keep = sender.receiver_count() > 0 || *sender.borrow() != CertificateStatus::Unknown;
        if !keep {
            debug!("No longer tracking certificate status {name}");
        }
        keep
    });
}
