//! Listener registry.
//!
//! # Responsibilities
//! - Own every bound listening socket, at most one per identity
//! - Diff the live set against a new configuration (open / close / keep)
//! - Reconstruct listeners from fds handed down by a predecessor master
//! - Export the ordered fd list for successors and workers
//!
//! # Design Decisions
//! - Listeners common to old and new config are never rebound, so their fd
//!   numbers are stable across reloads
//! - Removed listeners are closed immediately
//! - A Unix listener whose path vanished is treated as removed and re-added
//! - Registry order follows configuration order; that order is the
//!   inheritance order

use std::collections::HashSet;
use std::os::fd::{AsRawFd, RawFd};

use crate::config::ListenerConfig;
use crate::net::listener::{BindError, ListenAddress, Listener};

/// Environment variable carrying inherited listener fds to a successor master.
pub const INHERIT_FDS_ENV: &str = "PREFORK_INHERIT_FDS";

/// Set difference between the live listeners and a desired configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerDiff {
    pub to_open: Vec<ListenAddress>,
    pub to_close: Vec<ListenAddress>,
    pub unchanged: Vec<ListenAddress>,
}

impl ListenerDiff {
    pub fn is_empty(&self) -> bool {
        self.to_open.is_empty() && self.to_close.is_empty()
    }
}

/// Compute the difference between two listener sets by identity.
pub fn diff(current: &[ListenAddress], desired: &[ListenAddress]) -> ListenerDiff {
    let current_set: HashSet<&ListenAddress> = current.iter().collect();
    let desired_set: HashSet<&ListenAddress> = desired.iter().collect();

    ListenerDiff {
        to_open: desired
            .iter()
            .filter(|a| !current_set.contains(a))
            .cloned()
            .collect(),
        to_close: current
            .iter()
            .filter(|a| !desired_set.contains(a))
            .cloned()
            .collect(),
        unchanged: desired
            .iter()
            .filter(|a| current_set.contains(a))
            .cloned()
            .collect(),
    }
}

/// Outcome of applying a configuration to the registry.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub opened: Vec<ListenAddress>,
    pub closed: Vec<ListenAddress>,
    pub failed: Vec<BindError>,
}

/// Owns the set of bound listeners.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Listener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild listeners around fds supplied by a predecessor, skipping bind.
    ///
    /// # Safety
    ///
    /// Every fd must be an open socket that nothing else in this process owns.
    pub unsafe fn inherit(fds: &[RawFd]) -> Result<Self, BindError> {
        let mut registry = Self::new();
        for &fd in fds {
            let listener = Listener::from_inherited_fd(fd)?;
            if registry.get(listener.address()).is_some() {
                // Duplicate identity: keep the first, drop (close) the rest.
                tracing::warn!(address = %listener.address(), fd, "Duplicate inherited listener");
                continue;
            }
            registry.listeners.push(listener);
        }
        Ok(registry)
    }

    /// Inherit listeners named by [`INHERIT_FDS_ENV`], if it is set.
    ///
    /// The variable is removed so it does not leak into children.
    pub fn from_env() -> Result<Self, BindError> {
        let Ok(raw) = std::env::var(INHERIT_FDS_ENV) else {
            return Ok(Self::new());
        };
        std::env::remove_var(INHERIT_FDS_ENV);

        let fds = parse_fd_list(&raw);
        tracing::info!(fds = ?fds, "Inheriting listeners from predecessor");
        // SAFETY: the predecessor cleared close-on-exec on exactly these fds
        // for us and nothing in this process has opened them.
        unsafe { Self::inherit(&fds) }
    }

    /// Ordered fd list for a successor master.
    pub fn export_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(AsRawFd::as_raw_fd).collect()
    }

    /// Ordered fd list for worker `ordinal`, honoring per-worker assignment.
    pub fn fds_for_worker(&self, ordinal: usize) -> Vec<RawFd> {
        self.listeners
            .iter()
            .filter(|l| l.serves(ordinal))
            .map(AsRawFd::as_raw_fd)
            .collect()
    }

    pub fn addresses(&self) -> Vec<ListenAddress> {
        self.listeners.iter().map(|l| l.address().clone()).collect()
    }

    pub fn get(&self, address: &ListenAddress) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.address() == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Diff against `desired`, treating Unix listeners with a missing path as
    /// needing a rebind.
    pub fn plan(&self, desired: &[ListenerConfig]) -> ListenerDiff {
        let current: Vec<ListenAddress> = self
            .listeners
            .iter()
            .filter(|l| l.path_intact())
            .map(|l| l.address().clone())
            .collect();
        let desired: Vec<ListenAddress> = desired.iter().map(|l| l.address.clone()).collect();

        let mut plan = diff(&current, &desired);
        for listener in self.listeners.iter().filter(|l| !l.path_intact()) {
            plan.to_close.push(listener.address().clone());
        }
        plan
    }

    /// Bring the registry in line with `desired`.
    ///
    /// Bind failures are collected, not fatal; the caller decides.
    pub fn reconcile(&mut self, desired: &[ListenerConfig]) -> ReconcileReport {
        let plan = self.plan(desired);
        let mut report = ReconcileReport::default();

        for address in &plan.to_close {
            if let Some(pos) = self.listeners.iter().position(|l| l.address() == address) {
                let listener = self.listeners.remove(pos);
                tracing::info!(address = %address, fd = listener.as_raw_fd(), "Closing listener");
                report.closed.push(address.clone());
            }
        }

        for config in desired {
            if let Some(listener) = self
                .listeners
                .iter_mut()
                .find(|l| l.address() == &config.address)
            {
                if let Err(e) = listener.apply_options(config.options()) {
                    tracing::warn!(address = %config.address, error = %e, "Failed to apply socket options");
                }
                listener.set_workers(config.workers.clone());
                continue;
            }
            if !plan.to_open.contains(&config.address) {
                continue;
            }
            match Listener::bind(&config.address, config.options()) {
                Ok(mut listener) => {
                    listener.set_workers(config.workers.clone());
                    report.opened.push(listener.address().clone());
                    self.listeners.push(listener);
                }
                Err(e) => {
                    tracing::error!(address = %config.address, error = %e, "Failed to bind listener");
                    report.failed.push(e);
                }
            }
        }

        self.sort_by(desired);
        report
    }

    /// Close every listener.
    pub fn close_all(&mut self) {
        for listener in self.listeners.drain(..) {
            tracing::debug!(address = %listener.address(), "Closing listener");
        }
    }

    fn sort_by(&mut self, desired: &[ListenerConfig]) {
        let rank = |l: &Listener| {
            desired
                .iter()
                .position(|c| &c.address == l.address())
                .unwrap_or(usize::MAX)
        };
        self.listeners.sort_by_key(rank);
    }
}

/// Parse a comma-separated fd list, ignoring malformed entries.
pub fn parse_fd_list(raw: &str) -> Vec<RawFd> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<RawFd>().ok())
        .filter(|&fd| fd >= 0)
        .collect()
}

/// Format an fd list for [`INHERIT_FDS_ENV`].
pub fn format_fd_list(fds: &[RawFd]) -> String {
    fds.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
