//! Guest lifecycle observation and notification for the VM launcher.
//!
//! The hypervisor binding feeds [`notifier::EventSink`]; the dispatch loop in
//! [`notifier`] turns those callbacks into watch events delivered by
//! [`notify::NotifyClient`]. [`supervisor`] keeps the libvirt daemons alive.
pub mod config;
pub mod domain;
pub mod event;
pub mod hypervisor;
pub mod log_sink;
pub mod metadata;
pub mod notifier;
pub mod notify;
pub mod paths;
pub mod query;
pub mod supervisor;
pub mod tail;
pub mod translate;
pub mod vmm_monitor;
