/// Event dispatch loop.
///
/// One task owns all domain-observation state and merges four sources:
/// hypervisor callbacks (through [`EventSink`]), guest-agent updates,
/// hypervisor reconnect signals and launcher metadata changes. Each
/// hypervisor event or agent update re-queries the domain, translates its
/// state and sends the resulting watch events to the remote watcher.
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{
    DomainMetadata, DomainSnapshot, FsFreeze, GuestOsInfo, InterfaceStatus, LifeCycle, PausedReason,
    StateChangeReason, VmiRef,
};
use crate::event::{
    AgentLifecycleEvent, AgentState, AgentUpdate, DomainEvent, FailureStatus, HypervisorEvent,
    HypervisorEventKind, LifecycleEvent, LifecycleEventKind,
};
use crate::metadata::{MetadataCache, MetadataListener};
use crate::notify::{EventNotifier, EventSeverity};
use crate::query::{DiskErrorCode, DomainConnection, DomainHandle, QueryError};
use crate::translate::{translate, translate_reason};

/// Depth of the hypervisor event queue. Callbacks never block on it.
pub const EVENT_QUEUE_DEPTH: usize = 10;

const IO_ERROR_EVENT_REASON: &str = "IOerror";

/// Entry point for the native hypervisor binding. Every method is
/// non-blocking and safe to call from the binding's callback thread.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<HypervisorEvent>,
}

impl EventSink {
    pub fn lifecycle(&self, domain: &str, kind: LifecycleEventKind, detail: i32) {
        self.push(domain, HypervisorEventKind::Lifecycle(LifecycleEvent::new(kind, detail)));
    }

    pub fn device_added(&self, domain: &str) {
        self.push(domain, HypervisorEventKind::DeviceAdded);
    }

    pub fn device_removed(&self, domain: &str) {
        self.push(domain, HypervisorEventKind::DeviceRemoved);
    }

    pub fn memory_device_size_changed(&self, domain: &str) {
        self.push(domain, HypervisorEventKind::MemoryDeviceSizeChange);
    }

    pub fn agent_lifecycle(&self, domain: &str, state: AgentState, reason: i32) {
        self.push(
            domain,
            HypervisorEventKind::AgentLifecycle(AgentLifecycleEvent { state, reason }),
        );
    }

    fn push(&self, domain: &str, kind: HypervisorEventKind) {
        let event = HypervisorEvent {
            domain: domain.to_string(),
            kind,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(domain = %event.domain, kind = ?event.kind, "Hypervisor event queue is full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(domain = %event.domain, "Dispatch loop is gone, dropping hypervisor event");
            }
        }
    }
}

/// Creates the bounded hypervisor event queue.
pub fn event_channel() -> (EventSink, mpsc::Receiver<HypervisorEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (EventSink { tx }, rx)
}

/// Sending ends of a running dispatch loop, plus the one-shot first-event
/// receivers. Dropping `sink` (and every clone of it) ends the loop.
pub struct DomainNotifierHandle {
    pub sink: EventSink,
    pub agent_updates: mpsc::UnboundedSender<AgentUpdate>,
    pub reconnects: mpsc::Sender<()>,
    pub metadata: MetadataCache,
    pub first_added: mpsc::Receiver<DomainEvent>,
    pub first_deleted: mpsc::Receiver<DomainEvent>,
    pub task: JoinHandle<()>,
}

/// Wires a dispatch loop for the configured VMI and spawns it. The metadata
/// cache starts out with the VMI's UID.
pub fn start<C, N, P>(
    config: &Config,
    conn: Arc<C>,
    notifier: Arc<N>,
    poller: Arc<P>,
) -> DomainNotifierHandle
where
    C: DomainConnection + 'static,
    N: EventNotifier + 'static,
    P: AgentPoller + 'static,
{
    let (sink, events) = event_channel();
    let (agent_tx, agent_updates) = mpsc::unbounded_channel();
    let (reconnect_tx, reconnects) = mpsc::channel(1);
    let (added_tx, first_added) = mpsc::channel(1);
    let (deleted_tx, first_deleted) = mpsc::channel(1);
    let metadata = MetadataCache::new(DomainMetadata {
        uid: config.vmi.uid.clone(),
        ..DomainMetadata::default()
    });

    let dispatch = DomainNotifier::new(
        conn,
        notifier,
        poller,
        metadata.clone(),
        config.vmi.clone(),
        FirstEventSenders {
            added: added_tx,
            deleted: deleted_tx,
        },
    );
    let task = dispatch.spawn(NotifierInputs {
        events,
        agent_updates,
        reconnects,
    });

    DomainNotifierHandle {
        sink,
        agent_updates: agent_tx,
        reconnects: reconnect_tx,
        metadata,
        first_added,
        first_deleted,
        task,
    }
}

/// Start/stop hooks of the guest-agent poller.
pub trait AgentPoller: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Receiving ends of the channels the dispatch loop listens to. Metadata
/// changes arrive through the [`MetadataCache`] given to
/// [`DomainNotifier::new`].
pub struct NotifierInputs {
    pub events: mpsc::Receiver<HypervisorEvent>,
    pub agent_updates: mpsc::UnboundedReceiver<AgentUpdate>,
    pub reconnects: mpsc::Receiver<()>,
}

/// Channels receiving the first `Added` and the first deletion event, once each.
pub struct FirstEventSenders {
    pub added: mpsc::Sender<DomainEvent>,
    pub deleted: mpsc::Sender<DomainEvent>,
}

/// Guest-agent fields from the latest agent update, applied to every
/// refresh until the next update replaces them.
#[derive(Debug, Default)]
struct AgentFields {
    interfaces: Option<Vec<InterfaceStatus>>,
    os_info: Option<GuestOsInfo>,
    fs_freeze_status: Option<FsFreeze>,
}

impl AgentFields {
    /// A field missing from `update` is cleared, not kept.
    fn store(&mut self, update: AgentUpdate) {
        *self = Self {
            interfaces: update.interfaces,
            os_info: update.os_info,
            fs_freeze_status: update.fs_freeze_status,
        };
    }

    fn apply(&self, snapshot: &mut DomainSnapshot) {
        if let Some(interfaces) = &self.interfaces {
            snapshot.status.interfaces = interfaces.clone();
        }
        if let Some(os_info) = &self.os_info {
            snapshot.status.os_info = os_info.clone();
        }
        if let Some(fs_freeze_status) = &self.fs_freeze_status {
            snapshot.status.fs_freeze_status = fs_freeze_status.clone();
        }
    }
}

pub struct DomainNotifier<C, N, P>
where
    C: DomainConnection,
    N: EventNotifier,
    P: AgentPoller,
{
    conn: Arc<C>,
    notifier: Arc<N>,
    poller: Arc<P>,
    metadata: MetadataListener,
    vmi: VmiRef,
    first_events: FirstEventSenders,
    first_add_sent: bool,
    first_delete_sent: bool,
    snapshot: Option<DomainSnapshot>,
    agent: AgentFields,
    last_status: Option<(LifeCycle, StateChangeReason)>,
}

impl<C, N, P> DomainNotifier<C, N, P>
where
    C: DomainConnection + 'static,
    N: EventNotifier + 'static,
    P: AgentPoller + 'static,
{
    pub fn new(
        conn: Arc<C>,
        notifier: Arc<N>,
        poller: Arc<P>,
        metadata: MetadataCache,
        vmi: VmiRef,
        first_events: FirstEventSenders,
    ) -> Self {
        Self {
            conn,
            notifier,
            poller,
            metadata: metadata.listen(),
            vmi,
            first_events,
            first_add_sent: false,
            first_delete_sent: false,
            snapshot: None,
            agent: AgentFields::default(),
            last_status: None,
        }
    }

    /// Runs the loop on its own task.
    pub fn spawn(self, inputs: NotifierInputs) -> JoinHandle<()> {
        tokio::spawn(self.run(inputs))
    }

    /// Processes events until every [`EventSink`] has been dropped.
    pub async fn run(mut self, mut inputs: NotifierInputs) {
        info!(domain = %self.vmi.domain_name(), "Domain event dispatch loop started");
        loop {
            tokio::select! {
                event = inputs.events.recv() => {
                    let Some(event) = event else { break };
                    self.metadata.reset_notification();
                    self.handle_hypervisor_event(event).await;
                }
                Some(update) = inputs.agent_updates.recv() => {
                    self.metadata.reset_notification();
                    self.handle_agent_update(update).await;
                }
                Some(()) = inputs.reconnects.recv() => {
                    self.handle_reconnect().await;
                }
                true = self.metadata.changed() => {
                    self.handle_metadata_change().await;
                }
            }
        }
        info!("Domain event dispatch loop stopped");
    }

    async fn handle_hypervisor_event(&mut self, event: HypervisorEvent) {
        debug!(domain = %event.domain, kind = ?event.kind, "Received hypervisor event");
        let key = if event.domain.is_empty() {
            self.vmi.domain_name()
        } else {
            event.domain.clone()
        };
        self.snapshot = Some(DomainSnapshot::from_name(&key, &self.vmi.uid));
        self.refresh(event.lifecycle().copied()).await;

        if let HypervisorEventKind::AgentLifecycle(agent) = event.kind {
            match agent.state {
                AgentState::Connected => {
                    info!(domain = %key, "Guest agent connected, starting agent poller");
                    self.poller.start();
                }
                AgentState::Disconnected => {
                    info!(domain = %key, reason = agent.reason, "Guest agent disconnected, stopping agent poller");
                    self.poller.stop();
                }
            }
        }
    }

    async fn handle_agent_update(&mut self, update: AgentUpdate) {
        if self.snapshot.is_none() {
            self.snapshot = Some(DomainSnapshot::from_name(
                &self.vmi.domain_name(),
                &self.vmi.uid,
            ));
        }
        self.agent.store(update);
        self.refresh(None).await;
    }

    async fn handle_reconnect(&mut self) {
        let message = format!("Libvirt reconnect, domain {}", self.vmi.domain_name());
        info!("{message}");
        self.send(&DomainEvent::Error(FailureStatus::new(message))).await;
    }

    async fn handle_metadata_change(&mut self) {
        let Some(current) = &self.snapshot else {
            debug!("Metadata changed before any domain event, ignoring");
            return;
        };
        let key = current.domain_key();
        self.snapshot = Some(DomainSnapshot::from_name(&key, &self.vmi.uid));
        self.refresh(None).await;
    }

    /// Re-queries the current snapshot and sends the resulting events.
    async fn refresh(&mut self, trigger: Option<LifecycleEvent>) {
        let Some(mut snapshot) = self.snapshot.clone() else {
            return;
        };

        let handle = match self.query(&mut snapshot).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(domain = %snapshot.domain_key(), error = %e, "Could not refresh domain status");
                return;
            }
        };

        self.agent.apply(&mut snapshot);
        self.log_status(&snapshot);
        self.snapshot = Some(snapshot.clone());
        self.classify(snapshot, handle, trigger).await;
    }

    /// Fills `snapshot` from the hypervisor. Returns the domain handle, or
    /// `None` once the domain is known to be gone.
    async fn query(
        &mut self,
        snapshot: &mut DomainSnapshot,
    ) -> Result<Option<C::Handle>, QueryError> {
        let handle = match self.conn.lookup_by_name(&snapshot.domain_key()).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => {
                snapshot.set_state(LifeCycle::NoState, StateChangeReason::NonExistent);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let (state, reason) = match handle.get_state().await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                snapshot.set_state(LifeCycle::NoState, StateChangeReason::NonExistent);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        snapshot.set_state(translate(state), translate_reason(state, reason));

        match handle.get_spec_with_runtime_info().await {
            Ok(mut spec) => {
                // Changes stored before this point are part of this refresh.
                let metadata = self.metadata.current();
                if !metadata.uid.is_empty() {
                    snapshot.metadata.uid = metadata.uid.clone();
                }
                spec.metadata = Some(metadata);
                snapshot.spec = Some(spec);
            }
            Err(e) if e.is_not_found() => {
                snapshot.set_state(LifeCycle::NoState, StateChangeReason::NonExistent);
                return Ok(None);
            }
            // Metadata is unreadable during some transitions such as migration.
            Err(e) if e.is_invalid_operation() => {
                debug!(domain = %snapshot.domain_key(), error = %e, "Domain spec unavailable, sending status only");
            }
            Err(e) => return Err(e),
        }

        Ok(Some(handle))
    }

    fn log_status(&mut self, snapshot: &DomainSnapshot) {
        let status = (snapshot.status.status, snapshot.status.reason);
        if self.last_status == Some(status) {
            debug!(domain = %snapshot.domain_key(), status = ?status.0, reason = %status.1, "Domain status unchanged");
        } else {
            info!(domain = %snapshot.domain_key(), status = ?status.0, reason = %status.1, "Domain status changed");
            self.last_status = Some(status);
        }
    }

    async fn classify(
        &mut self,
        mut snapshot: DomainSnapshot,
        handle: Option<C::Handle>,
        trigger: Option<LifecycleEvent>,
    ) {
        match snapshot.status.reason {
            StateChangeReason::NonExistent => {
                snapshot.metadata.deletion_timestamp =
                    Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
                let event = DomainEvent::Modified(snapshot);
                self.send(&event).await;
                if !self.first_delete_sent {
                    self.first_delete_sent = true;
                    if self.first_events.deleted.send(event).await.is_err() {
                        debug!("Nobody is waiting for the domain deletion event");
                    }
                }
            }
            StateChangeReason::Paused(PausedReason::IoError) => {
                let Some(handle) = handle else { return };
                self.report_disk_errors(&snapshot, &handle).await;
            }
            _ => {
                if trigger.is_some_and(|t| t.announces_domain()) {
                    let event = DomainEvent::Added(snapshot.clone());
                    self.send(&event).await;
                    if !self.first_add_sent {
                        self.first_add_sent = true;
                        if self.first_events.added.send(event).await.is_err() {
                            debug!("Nobody is waiting for the domain added event");
                        }
                    }
                }
                self.send(&DomainEvent::Modified(snapshot)).await;
            }
        }
    }

    async fn report_disk_errors(&self, snapshot: &DomainSnapshot, handle: &C::Handle) {
        let disk_errors = match handle.get_disk_errors().await {
            Ok(errors) => errors,
            Err(e) => {
                error!(domain = %snapshot.domain_key(), error = %e, "Could not read disk errors");
                return;
            }
        };

        for disk in disk_errors {
            let volume = snapshot.volume_name_by_target(&disk.target);
            let message = match disk.error {
                DiskErrorCode::None => continue,
                DiskErrorCode::Unspecified => {
                    format!("VM Paused due to IO error at the volume: {volume}")
                }
                DiskErrorCode::NoSpace => {
                    format!("VM Paused due to not enough space on volume: {volume}")
                }
                DiskErrorCode::Unrecognized(_) => String::new(),
            };

            if let Err(e) = self
                .notifier
                .send_k8s_event(&self.vmi, EventSeverity::Warning, IO_ERROR_EVENT_REASON, &message)
                .await
            {
                error!(disk = %disk.target, error = %e, "Failed to send IO error event");
            }
            self.send(&DomainEvent::Modified(snapshot.clone())).await;
        }
    }

    async fn send(&self, event: &DomainEvent) {
        if let Err(e) = self.notifier.send_domain_event(event).await {
            error!(event_type = event.event_type(), error = %e, "Failed to send domain event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DiskSpec, DomainMetadata, DomainSpec};
    use crate::event::{DEFINED_DETAIL_ADDED, STARTED_DETAIL_MIGRATED};
    use crate::notify::NotifyError;
    use crate::query::DiskError;
    use crate::translate::DomainState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ── fakes ─────────────────────────────────────────────────────────────────

    #[derive(Clone)]
    struct FakeDomain {
        state: (DomainState, i32),
        spec: Result<DomainSpec, QueryError>,
        disk_errors: Vec<DiskError>,
        /// Written to while the state is being read.
        metadata_writer: Option<MetadataCache>,
    }

    impl FakeDomain {
        fn running() -> Self {
            Self {
                state: (DomainState::Running, 1),
                spec: Ok(DomainSpec {
                    name: "ns_vm".to_string(),
                    ..DomainSpec::default()
                }),
                disk_errors: Vec::new(),
                metadata_writer: None,
            }
        }
    }

    #[async_trait]
    impl DomainHandle for FakeDomain {
        async fn get_state(&self) -> Result<(DomainState, i32), QueryError> {
            if let Some(cache) = &self.metadata_writer {
                cache.store(|m| m.uid = "written-mid-refresh".to_string());
            }
            Ok(self.state)
        }

        async fn get_spec_with_runtime_info(&self) -> Result<DomainSpec, QueryError> {
            self.spec.clone()
        }

        async fn get_disk_errors(&self) -> Result<Vec<DiskError>, QueryError> {
            Ok(self.disk_errors.clone())
        }
    }

    /// `Ok(None)` means the domain does not exist.
    struct FakeConnection {
        domain: Mutex<Result<Option<FakeDomain>, QueryError>>,
        lookups: Mutex<Vec<String>>,
    }

    impl FakeConnection {
        fn with(domain: Option<FakeDomain>) -> Arc<Self> {
            Arc::new(Self {
                domain: Mutex::new(Ok(domain)),
                lookups: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, domain: Result<Option<FakeDomain>, QueryError>) {
            *self.domain.lock().unwrap() = domain;
        }
    }

    #[async_trait]
    impl DomainConnection for FakeConnection {
        type Handle = FakeDomain;

        async fn lookup_by_name(&self, name: &str) -> Result<FakeDomain, QueryError> {
            self.lookups.lock().unwrap().push(name.to_string());
            match self.domain.lock().unwrap().clone() {
                Ok(Some(domain)) => Ok(domain),
                Ok(None) => Err(QueryError::NotFound),
                Err(e) => Err(e),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        domain_events: Mutex<Vec<DomainEvent>>,
        k8s_events: Mutex<Vec<(EventSeverity, String, String)>>,
    }

    impl RecordingNotifier {
        fn event_types(&self) -> Vec<&'static str> {
            self.domain_events
                .lock()
                .unwrap()
                .iter()
                .map(DomainEvent::event_type)
                .collect()
        }
    }

    #[async_trait]
    impl EventNotifier for RecordingNotifier {
        async fn send_domain_event(&self, event: &DomainEvent) -> Result<(), NotifyError> {
            self.domain_events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn send_k8s_event(
            &self,
            _vmi: &VmiRef,
            severity: EventSeverity,
            reason: &str,
            message: &str,
        ) -> Result<(), NotifyError> {
            self.k8s_events
                .lock()
                .unwrap()
                .push((severity, reason.to_string(), message.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingPoller {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl AgentPoller for CountingPoller {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        conn: Arc<FakeConnection>,
        notifier: Arc<RecordingNotifier>,
        poller: Arc<CountingPoller>,
        metadata: MetadataCache,
        added_rx: mpsc::Receiver<DomainEvent>,
        deleted_rx: mpsc::Receiver<DomainEvent>,
    }

    fn vmi() -> VmiRef {
        VmiRef {
            namespace: "ns".to_string(),
            name: "vm".to_string(),
            uid: "vmi-uid".to_string(),
        }
    }

    fn setup(
        domain: Option<FakeDomain>,
    ) -> (
        DomainNotifier<FakeConnection, RecordingNotifier, CountingPoller>,
        Harness,
    ) {
        let conn = FakeConnection::with(domain);
        let notifier = Arc::new(RecordingNotifier::default());
        let poller = Arc::new(CountingPoller::default());
        let metadata = MetadataCache::default();
        let (added_tx, added_rx) = mpsc::channel(10);
        let (deleted_tx, deleted_rx) = mpsc::channel(10);

        let dispatch = DomainNotifier::new(
            Arc::clone(&conn),
            Arc::clone(&notifier),
            Arc::clone(&poller),
            metadata.clone(),
            vmi(),
            FirstEventSenders {
                added: added_tx,
                deleted: deleted_tx,
            },
        );
        let harness = Harness {
            conn,
            notifier,
            poller,
            metadata,
            added_rx,
            deleted_rx,
        };
        (dispatch, harness)
    }

    fn lifecycle(kind: LifecycleEventKind, detail: i32) -> HypervisorEvent {
        HypervisorEvent {
            domain: "ns_vm".to_string(),
            kind: HypervisorEventKind::Lifecycle(LifecycleEvent::new(kind, detail)),
        }
    }

    struct RunningLoop {
        sink: EventSink,
        agent_tx: mpsc::UnboundedSender<AgentUpdate>,
        reconnect_tx: mpsc::Sender<()>,
        handle: JoinHandle<()>,
    }

    impl RunningLoop {
        async fn stop(self) {
            drop(self.sink);
            tokio::time::timeout(std::time::Duration::from_secs(5), self.handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    fn spawn_loop(
        dispatch: DomainNotifier<FakeConnection, RecordingNotifier, CountingPoller>,
    ) -> RunningLoop {
        let (sink, events) = event_channel();
        let (agent_tx, agent_updates) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnects) = mpsc::channel(1);
        let handle = dispatch.spawn(NotifierInputs {
            events,
            agent_updates,
            reconnects,
        });
        RunningLoop {
            sink,
            agent_tx,
            reconnect_tx,
            handle,
        }
    }

    async fn wait_for_events(notifier: &RecordingNotifier, n: usize) {
        for _ in 0..200 {
            if notifier.domain_events.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {n} events, got {:?}", notifier.event_types());
    }

    fn drain(rx: &mut mpsc::Receiver<DomainEvent>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    // ── event sink ────────────────────────────────────────────────────────────

    #[test]
    fn full_queue_drops_newest_event() {
        let (sink, mut rx) = event_channel();
        for i in 0..EVENT_QUEUE_DEPTH {
            sink.lifecycle(&format!("ns_vm{i}"), LifecycleEventKind::Resumed, 0);
        }
        sink.device_added("ns_overflow");

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), EVENT_QUEUE_DEPTH);
        assert_eq!(received[0].domain, "ns_vm0");
        assert!(received.iter().all(|e| e.domain != "ns_overflow"));
    }

    #[test]
    fn sink_outlives_loop_without_panicking() {
        let (sink, rx) = event_channel();
        drop(rx);
        sink.memory_device_size_changed("ns_vm");
    }

    // ── lifecycle events ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn defined_added_sends_added_then_modified() {
        let (mut dispatch, mut h) = setup(Some(FakeDomain::running()));
        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Defined, DEFINED_DETAIL_ADDED))
            .await;

        assert_eq!(h.notifier.event_types(), vec!["ADDED", "MODIFIED"]);
        let events = h.notifier.domain_events.lock().unwrap().clone();
        let domain = events[1].domain().unwrap();
        assert_eq!(domain.status.status, LifeCycle::Running);
        assert_eq!(domain.metadata.uid, "vmi-uid");
        assert!(domain.spec.is_some());
        assert_eq!(drain(&mut h.added_rx), 1);
    }

    #[tokio::test]
    async fn first_added_forwarded_once() {
        let (mut dispatch, mut h) = setup(Some(FakeDomain::running()));
        for _ in 0..3 {
            dispatch
                .handle_hypervisor_event(lifecycle(LifecycleEventKind::Defined, DEFINED_DETAIL_ADDED))
                .await;
        }
        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Started, STARTED_DETAIL_MIGRATED))
            .await;

        assert_eq!(drain(&mut h.added_rx), 1);
        let added = h
            .notifier
            .event_types()
            .into_iter()
            .filter(|t| *t == "ADDED")
            .count();
        assert_eq!(added, 4);
    }

    #[tokio::test]
    async fn plain_lifecycle_event_sends_modified_only() {
        let (mut dispatch, mut h) = setup(Some(FakeDomain::running()));
        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Resumed, 0))
            .await;
        assert_eq!(h.notifier.event_types(), vec!["MODIFIED"]);
        assert_eq!(drain(&mut h.added_rx), 0);
    }

    #[tokio::test]
    async fn missing_domain_is_reported_deleted_once() {
        let (mut dispatch, mut h) = setup(None);
        for _ in 0..3 {
            dispatch
                .handle_hypervisor_event(lifecycle(LifecycleEventKind::Undefined, 0))
                .await;
        }

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        for event in &events {
            let domain = event.domain().unwrap();
            assert_eq!(event.event_type(), "MODIFIED");
            assert_eq!(domain.status.status, LifeCycle::NoState);
            assert_eq!(domain.status.reason, StateChangeReason::NonExistent);
            assert!(domain.is_deleted());
        }
        assert_eq!(drain(&mut h.deleted_rx), 1);
    }

    #[tokio::test]
    async fn empty_event_domain_falls_back_to_configured_name() {
        let (mut dispatch, h) = setup(Some(FakeDomain::running()));
        dispatch
            .handle_hypervisor_event(HypervisorEvent {
                domain: String::new(),
                kind: HypervisorEventKind::DeviceAdded,
            })
            .await;
        assert_eq!(*h.conn.lookups.lock().unwrap(), vec!["ns_vm".to_string()]);
    }

    #[tokio::test]
    async fn query_failure_aborts_event_only() {
        let (mut dispatch, h) = setup(Some(FakeDomain::running()));
        h.conn.set(Err(QueryError::Other("connection reset".to_string())));
        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Resumed, 0))
            .await;
        assert!(h.notifier.event_types().is_empty());

        h.conn.set(Ok(Some(FakeDomain::running())));
        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Resumed, 0))
            .await;
        assert_eq!(h.notifier.event_types(), vec!["MODIFIED"]);
    }

    #[tokio::test]
    async fn invalid_operation_on_spec_is_tolerated() {
        let mut domain = FakeDomain::running();
        domain.spec = Err(QueryError::InvalidOperation("domain is migrating".to_string()));
        let (mut dispatch, h) = setup(Some(domain));

        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Resumed, 0))
            .await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        let snapshot = events[0].domain().unwrap();
        assert!(snapshot.spec.is_none());
        assert_eq!(snapshot.status.status, LifeCycle::Running);
    }

    #[tokio::test]
    async fn spec_metadata_comes_from_cache() {
        let (mut dispatch, h) = setup(Some(FakeDomain::running()));
        h.metadata.store(|m| {
            m.uid = "cached-uid".to_string();
            m.extra
                .insert("gracePeriod".to_string(), serde_json::json!({"seconds": 30}));
        });

        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Resumed, 0))
            .await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        let snapshot = events[0].domain().unwrap();
        assert_eq!(snapshot.metadata.uid, "cached-uid");
        let metadata: &DomainMetadata = snapshot.spec.as_ref().unwrap().metadata.as_ref().unwrap();
        assert_eq!(metadata.extra["gracePeriod"]["seconds"], 30);
    }

    // ── IO errors ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn io_error_pause_fans_out_per_failed_disk() {
        let mut domain = FakeDomain::running();
        domain.state = (DomainState::Paused, 5);
        domain.spec = Ok(DomainSpec {
            name: "ns_vm".to_string(),
            disks: vec![
                DiskSpec {
                    target: "vda".to_string(),
                    alias: Some("ua-rootdisk".to_string()),
                },
                DiskSpec {
                    target: "vdb".to_string(),
                    alias: Some("ua-data".to_string()),
                },
                DiskSpec {
                    target: "vdc".to_string(),
                    alias: Some("ua-cache".to_string()),
                },
            ],
            ..DomainSpec::default()
        });
        domain.disk_errors = vec![
            DiskError {
                target: "vda".to_string(),
                error: DiskErrorCode::Unspecified,
            },
            DiskError {
                target: "vdb".to_string(),
                error: DiskErrorCode::None,
            },
            DiskError {
                target: "vdc".to_string(),
                error: DiskErrorCode::NoSpace,
            },
        ];
        let (mut dispatch, h) = setup(Some(domain));

        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Suspended, 2))
            .await;

        let k8s = h.notifier.k8s_events.lock().unwrap().clone();
        assert_eq!(
            k8s,
            vec![
                (
                    EventSeverity::Warning,
                    "IOerror".to_string(),
                    "VM Paused due to IO error at the volume: rootdisk".to_string()
                ),
                (
                    EventSeverity::Warning,
                    "IOerror".to_string(),
                    "VM Paused due to not enough space on volume: cache".to_string()
                ),
            ]
        );
        assert_eq!(h.notifier.event_types(), vec!["MODIFIED", "MODIFIED"]);
    }

    #[tokio::test]
    async fn unrecognized_disk_error_sends_empty_message() {
        let mut domain = FakeDomain::running();
        domain.state = (DomainState::Paused, 5);
        domain.disk_errors = vec![DiskError {
            target: "vda".to_string(),
            error: DiskErrorCode::Unrecognized(7),
        }];
        let (mut dispatch, h) = setup(Some(domain));

        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Suspended, 2))
            .await;

        let k8s = h.notifier.k8s_events.lock().unwrap().clone();
        assert_eq!(k8s.len(), 1);
        assert!(k8s[0].2.is_empty());
    }

    // ── agent ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn agent_lifecycle_drives_poller() {
        let (mut dispatch, h) = setup(Some(FakeDomain::running()));
        let agent_event = |state| HypervisorEvent {
            domain: "ns_vm".to_string(),
            kind: HypervisorEventKind::AgentLifecycle(AgentLifecycleEvent { state, reason: 2 }),
        };

        dispatch.handle_hypervisor_event(agent_event(AgentState::Connected)).await;
        dispatch.handle_hypervisor_event(agent_event(AgentState::Disconnected)).await;

        assert_eq!(h.poller.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.poller.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.notifier.event_types(), vec!["MODIFIED", "MODIFIED"]);
    }

    #[tokio::test]
    async fn agent_update_replaces_previous_guest_fields() {
        let (mut dispatch, h) = setup(Some(FakeDomain::running()));
        dispatch
            .handle_agent_update(AgentUpdate {
                interfaces: Some(vec![InterfaceStatus::default()]),
                os_info: Some(GuestOsInfo {
                    name: "Fedora".to_string(),
                    ..GuestOsInfo::default()
                }),
                ..AgentUpdate::default()
            })
            .await;
        dispatch
            .handle_agent_update(AgentUpdate {
                fs_freeze_status: Some(FsFreeze {
                    status: "frozen".to_string(),
                }),
                ..AgentUpdate::default()
            })
            .await;
        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Resumed, 0))
            .await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        let first = events[0].domain().unwrap();
        assert_eq!(first.status.os_info.name, "Fedora");
        assert_eq!(first.status.interfaces.len(), 1);

        // The second update carried no OS info or interfaces, so they are gone.
        for event in &events[1..] {
            let domain = event.domain().unwrap();
            assert_eq!(domain.status.os_info, GuestOsInfo::default());
            assert!(domain.status.interfaces.is_empty());
            assert_eq!(domain.status.fs_freeze_status.status, "frozen");
        }
    }

    // ── reconnect and metadata ────────────────────────────────────────────────

    #[tokio::test]
    async fn reconnect_sends_error_event_without_query() {
        let (mut dispatch, h) = setup(Some(FakeDomain::running()));
        dispatch.handle_reconnect().await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![DomainEvent::Error(FailureStatus::new("Libvirt reconnect, domain ns_vm"))]
        );
        assert!(h.conn.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_change_ignored_before_first_event() {
        let (mut dispatch, h) = setup(Some(FakeDomain::running()));
        dispatch.handle_metadata_change().await;
        assert!(h.notifier.event_types().is_empty());
        assert!(h.conn.lookups.lock().unwrap().is_empty());

        dispatch
            .handle_hypervisor_event(lifecycle(LifecycleEventKind::Resumed, 0))
            .await;
        dispatch.handle_metadata_change().await;
        assert_eq!(h.notifier.event_types(), vec!["MODIFIED", "MODIFIED"]);
    }

    // ── loop ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn loop_processes_events_until_sinks_dropped() {
        let (dispatch, mut h) = setup(Some(FakeDomain::running()));
        let running = spawn_loop(dispatch);

        running
            .sink
            .lifecycle("ns_vm", LifecycleEventKind::Defined, DEFINED_DETAIL_ADDED);
        running.sink.lifecycle("ns_vm", LifecycleEventKind::Resumed, 0);
        running.stop().await;

        assert_eq!(h.notifier.event_types(), vec!["ADDED", "MODIFIED", "MODIFIED"]);
        assert_eq!(drain(&mut h.added_rx), 1);
    }

    #[tokio::test]
    async fn loop_reports_reconnect_as_error_event() {
        let (dispatch, h) = setup(Some(FakeDomain::running()));
        let running = spawn_loop(dispatch);

        running.reconnect_tx.send(()).await.unwrap();
        wait_for_events(&h.notifier, 1).await;
        running.stop().await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![DomainEvent::Error(FailureStatus::new("Libvirt reconnect, domain ns_vm"))]
        );
        assert!(h.conn.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn loop_ignores_metadata_stored_before_first_event() {
        let (dispatch, h) = setup(Some(FakeDomain::running()));
        let running = spawn_loop(dispatch);

        h.metadata.store(|m| m.uid = "early".to_string());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(h.notifier.event_types().is_empty());
        assert!(h.conn.lookups.lock().unwrap().is_empty());

        running.sink.lifecycle("ns_vm", LifecycleEventKind::Resumed, 0);
        wait_for_events(&h.notifier, 1).await;
        running.stop().await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].domain().unwrap().metadata.uid, "early");
    }

    #[tokio::test]
    async fn loop_refreshes_on_metadata_change_after_first_event() {
        let (dispatch, h) = setup(Some(FakeDomain::running()));
        let running = spawn_loop(dispatch);

        running.sink.lifecycle("ns_vm", LifecycleEventKind::Resumed, 0);
        wait_for_events(&h.notifier, 1).await;
        h.metadata.store(|m| m.uid = "late".to_string());
        wait_for_events(&h.notifier, 2).await;
        running.stop().await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(h.notifier.event_types(), vec!["MODIFIED", "MODIFIED"]);
        assert_eq!(events[1].domain().unwrap().metadata.uid, "late");
    }

    #[tokio::test]
    async fn metadata_written_during_refresh_does_not_trigger_another() {
        let (dispatch, h) = setup(None);
        let mut domain = FakeDomain::running();
        domain.metadata_writer = Some(h.metadata.clone());
        h.conn.set(Ok(Some(domain)));
        let running = spawn_loop(dispatch);

        running.sink.lifecycle("ns_vm", LifecycleEventKind::Resumed, 0);
        wait_for_events(&h.notifier, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        running.stop().await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(h.notifier.event_types(), vec!["MODIFIED"]);
        assert_eq!(events[0].domain().unwrap().metadata.uid, "written-mid-refresh");
        assert_eq!(h.conn.lookups.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn loop_refreshes_on_agent_update() {
        let (dispatch, h) = setup(Some(FakeDomain::running()));
        let running = spawn_loop(dispatch);

        running
            .agent_tx
            .send(AgentUpdate {
                fs_freeze_status: Some(FsFreeze {
                    status: "thawed".to_string(),
                }),
                ..AgentUpdate::default()
            })
            .unwrap();
        wait_for_events(&h.notifier, 1).await;
        running.stop().await;

        let events = h.notifier.domain_events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].domain().unwrap().status.fs_freeze_status.status, "thawed");
    }

    // ── wiring ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_wires_loop_for_configured_vmi() {
        let mut config = Config::default();
        config.vmi = vmi();
        let conn = FakeConnection::with(Some(FakeDomain::running()));
        let notifier = Arc::new(RecordingNotifier::default());
        let poller = Arc::new(CountingPoller::default());

        let mut handle = start(&config, Arc::clone(&conn), Arc::clone(&notifier), poller);
        assert_eq!(handle.metadata.load().uid, "vmi-uid");

        handle.sink.lifecycle("", LifecycleEventKind::Defined, DEFINED_DETAIL_ADDED);
        let first_added = handle.first_added.recv();
        let added = tokio::time::timeout(std::time::Duration::from_secs(5), first_added)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(added.domain().unwrap().metadata.uid, "vmi-uid");
        assert_eq!(*conn.lookups.lock().unwrap(), vec!["ns_vm".to_string()]);

        handle.reconnects.send(()).await.unwrap();
        wait_for_events(&notifier, 3).await;
        assert_eq!(notifier.event_types(), vec!["ADDED", "MODIFIED", "ERROR"]);

        drop(handle.sink);
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.task)
            .await
            .unwrap()
            .unwrap();
    }
}
