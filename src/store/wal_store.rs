use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};

use crate::limits::MAX_APPOINTMENTS;
use crate::model::*;
use crate::wal::Wal;

use super::{AppointmentStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Appointment store backed by in-memory maps and a write-ahead log.
///
/// Every mutation is appended to the WAL before it becomes visible. The
/// container index doubles as the uniqueness constraint: a booking reserves
/// its container number before the append and releases it if the append fails.
/// Writers of one appointment hold its record lock from append to apply, so
/// the map always shows the last event the log holds for that id.
pub struct WalStore {
    appointments: DashMap<AppointmentId, Appointment>,
    /// container number → owning appointment
    containers: DashMap<String, AppointmentId>,
    record_locks: DashMap<AppointmentId, Arc<Mutex<()>>>,
    next_id: AtomicU64,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared from WAL append to map update; compaction
    /// holds it exclusively so its snapshot matches the log it replaces.
    compaction: RwLock<()>,
}

impl WalStore {
    /// Replay the WAL at `path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            appointments: DashMap::new(),
            containers: DashMap::new(),
            record_locks: DashMap::new(),
            next_id: AtomicU64::new(1),
            wal_tx,
            compaction: RwLock::new(()),
        };
        for event in &events {
            store.apply(event);
        }
        tracing::debug!(
            "replayed {} events from {}: {} live appointments",
            events.len(),
            path.display(),
            store.appointments.len()
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }

    /// Apply a replayed event. Never touches the WAL.
    fn apply(&self, event: &Event) {
        match event {
            Event::AppointmentBooked { appointment } => {
                self.bump_sequence(appointment.id.0 + 1);
                self.containers
                    .insert(appointment.container_number.clone(), appointment.id);
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentUpdated { appointment } => {
                if let Some(mut current) = self.appointments.get_mut(&appointment.id) {
                    if current.container_number != appointment.container_number {
                        self.containers.remove(&current.container_number);
                        self.containers
                            .insert(appointment.container_number.clone(), appointment.id);
                    }
                    *current = appointment.clone();
                }
            }
            Event::AppointmentDeleted { id } => {
                if let Some((_, removed)) = self.appointments.remove(id) {
                    self.containers
                        .remove_if(&removed.container_number, |_, owner| owner == id);
                }
            }
            Event::SequenceAt { next_id } => self.bump_sequence(*next_id),
        }
    }

    /// Exclusive write access to one appointment. Unknown ids get no lock
    /// entry, so lookups of bogus ids leave nothing behind.
    async fn lock_record(&self, id: AppointmentId) -> Result<OwnedMutexGuard<()>, StoreError> {
        if !self.appointments.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let lock = self.record_locks.entry(id).or_default().value().clone();
        Ok(lock.lock_owned().await)
    }

    fn bump_sequence(&self, at_least: u64) {
        self.next_id.fetch_max(at_least, Ordering::SeqCst);
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction.write().await;
        let mut events = vec![Event::SequenceAt {
            next_id: self.next_id.load(Ordering::SeqCst),
        }];
        let mut live: Vec<Appointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        live.sort_by_key(|a| a.id);
        events.extend(
            live.into_iter()
                .map(|appointment| Event::AppointmentBooked { appointment }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl AppointmentStore for WalStore {
    async fn insert(&self, mut appointment: Appointment) -> Result<Appointment, StoreError> {
        if self.appointments.len() >= MAX_APPOINTMENTS {
            return Err(StoreError::LimitExceeded("too many appointments"));
        }
        let _writing = self.compaction.read().await;

        // Reserve the container number. The shard guard is released before
        // the WAL await; the reservation itself keeps racing bookings out.
        let id = match self.containers.entry(appointment.container_number.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::DuplicateContainer(appointment.container_number));
            }
            Entry::Vacant(slot) => {
                let id = AppointmentId(self.next_id.fetch_add(1, Ordering::SeqCst));
                slot.insert(id);
                id
            }
        };
        appointment.id = id;

        let event = Event::AppointmentBooked { appointment: appointment.clone() };
        if let Err(e) = self.wal_append(event).await {
            self.containers
                .remove_if(&appointment.container_number, |_, owner| *owner == id);
            return Err(e);
        }
        self.appointments.insert(id, appointment.clone());
        Ok(appointment)
    }

    async fn find_by_id(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        Ok(self.appointments.get(&id).map(|e| e.value().clone()))
    }

    async fn update(&self, appointment: Appointment) -> Result<(), StoreError> {
        let _writing = self.compaction.read().await;
        let id = appointment.id;
        let _record = self.lock_record(id).await?;
        let previous_container = self
            .appointments
            .get(&id)
            .map(|e| e.container_number.clone())
            .ok_or(StoreError::NotFound(id))?;

        let rekeyed = previous_container != appointment.container_number;
        if rekeyed {
            match self.containers.entry(appointment.container_number.clone()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::DuplicateContainer(appointment.container_number));
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let event = Event::AppointmentUpdated { appointment: appointment.clone() };
        if let Err(e) = self.wal_append(event).await {
            if rekeyed {
                self.containers
                    .remove_if(&appointment.container_number, |_, owner| *owner == id);
            }
            return Err(e);
        }

        match self.appointments.get_mut(&id) {
            Some(mut current) => {
                *current = appointment;
                if rekeyed {
                    self.containers
                        .remove_if(&previous_container, |_, owner| *owner == id);
                }
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn delete(&self, id: AppointmentId) -> Result<(), StoreError> {
        let _writing = self.compaction.read().await;
        let _record = self.lock_record(id).await?;
        if !self.appointments.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.wal_append(Event::AppointmentDeleted { id }).await?;
        let (_, removed) = self
            .appointments
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        self.containers
            .remove_if(&removed.container_number, |_, owner| *owner == id);
        // ids are never reused; late waiters still hold their own clone
        self.record_locks.remove(&id);
        Ok(())
    }

    async fn exists_by_container_number(&self, container_number: &str) -> Result<bool, StoreError> {
        Ok(self.containers.contains_key(container_number))
    }

    async fn query_by_created_range(
        &self,
        start: NaiveDateTime,
        end_exclusive: NaiveDateTime,
    ) -> Result<Vec<Appointment>, StoreError> {
        Ok(self
            .appointments
            .iter()
            .filter(|e| start <= e.created && e.created < end_exclusive)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        Ok(self.appointments.iter().map(|e| e.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gatebook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn draft(container: &str, created: &str) -> Appointment {
        let created = ts(created);
        Appointment {
            id: AppointmentId(0),
            company_id: CompanyId(1),
            terminal_id: TerminalId(7),
            driver_id: DriverId(1),
            container_number: container.into(),
            move_type: "Import".into(),
            size_type: "40HC".into(),
            line: "MSC".into(),
            chassis_no: "CH-1".into(),
            gate_code: "AC007".into(),
            status: AppointmentStatus::Scheduled,
            created,
            valid_through: valid_through(created).unwrap(),
            last_modified: ts("2024-03-01T00:00:00"),
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids() {
        let store = WalStore::open(test_wal_path("sequential_ids.wal")).unwrap();
        let a = store.insert(draft("MSCU0000001", "2024-03-10T08:00:00")).await.unwrap();
        let b = store.insert(draft("MSCU0000002", "2024-03-10T09:00:00")).await.unwrap();
        assert_eq!(a.id, AppointmentId(1));
        assert_eq!(b.id, AppointmentId(2));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_container_rejected() {
        let store = WalStore::open(test_wal_path("dup_container.wal")).unwrap();
        store.insert(draft("MSCU1234567", "2024-03-10T08:00:00")).await.unwrap();
        let result = store.insert(draft("MSCU1234567", "2024-03-11T08:00:00")).await;
        assert!(matches!(result, Err(StoreError::DuplicateContainer(ref c)) if c == "MSCU1234567"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_of_same_container_admit_one() {
        let store = Arc::new(WalStore::open(test_wal_path("race_container.wal")).unwrap());
        let mut handles = Vec::new();
        for hour in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert(draft("TGHU9999999", &format!("2024-03-10T{hour:02}:00:00")))
                    .await
            }));
        }
        let mut ok = 0;
        let mut dup = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::DuplicateContainer(_)) => dup += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, dup), (1, 15));
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    async fn assert_memory_matches_log(store: &WalStore, path: PathBuf, id: AppointmentId) {
        let live = store.find_by_id(id).await.unwrap();
        let reopened = WalStore::open(path).unwrap();
        assert_eq!(live, reopened.find_by_id(id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_updates_of_one_record_match_replay() {
        for round in 0..10 {
            let path = test_wal_path(&format!("update_race_{round}.wal"));
            let store = Arc::new(WalStore::open(path.clone()).unwrap());
            let base = store.insert(draft("MSCU1234567", "2024-03-10T08:00:00")).await.unwrap();

            let mut handles = Vec::new();
            for i in 0..32 {
                let store = store.clone();
                let mut next = base.clone();
                next.move_type = format!("m{i}");
                handles.push(tokio::spawn(async move { store.update(next).await }));
            }
            for h in handles {
                h.await.unwrap().unwrap();
            }
            assert_memory_matches_log(&store, path, base.id).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn status_writes_racing_a_delete_match_replay() {
        for round in 0..10 {
            let path = test_wal_path(&format!("delete_race_{round}.wal"));
            let store = Arc::new(WalStore::open(path.clone()).unwrap());
            let base = store.insert(draft("MSCU1234567", "2024-03-10T08:00:00")).await.unwrap();

            let mut handles = Vec::new();
            for i in 0..16 {
                let store = store.clone();
                let mut next = base.clone();
                next.status = if i % 2 == 0 {
                    AppointmentStatus::Approved
                } else {
                    AppointmentStatus::Canceled
                };
                handles.push(tokio::spawn(async move { store.update(next).await }));
            }
            let deleter = {
                let store = store.clone();
                tokio::spawn(async move { store.delete(base.id).await })
            };
            for h in handles {
                let _ = h.await.unwrap();
            }
            deleter.await.unwrap().unwrap();
            assert_memory_matches_log(&store, path, base.id).await;
        }
    }

    #[tokio::test]
    async fn delete_frees_container_number() {
        let store = WalStore::open(test_wal_path("delete_frees.wal")).unwrap();
        let a = store.insert(draft("MSCU1234567", "2024-03-10T08:00:00")).await.unwrap();
        store.delete(a.id).await.unwrap();
        assert!(!store.exists_by_container_number("MSCU1234567").await.unwrap());
        assert!(store.find_by_id(a.id).await.unwrap().is_none());
        assert!(matches!(store.delete(a.id).await, Err(StoreError::NotFound(_))));

        let b = store.insert(draft("MSCU1234567", "2024-03-11T08:00:00")).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = WalStore::open(test_wal_path("update_missing.wal")).unwrap();
        let mut ghost = draft("MSCU1234567", "2024-03-10T08:00:00");
        ghost.id = AppointmentId(77);
        assert!(matches!(store.update(ghost).await, Err(StoreError::NotFound(AppointmentId(77)))));
    }

    #[tokio::test]
    async fn update_rekeys_container_index() {
        let store = WalStore::open(test_wal_path("update_rekey.wal")).unwrap();
        let mut a = store.insert(draft("MSCU0000001", "2024-03-10T08:00:00")).await.unwrap();
        store.insert(draft("MSCU0000002", "2024-03-10T08:00:00")).await.unwrap();

        a.container_number = "MSCU0000002".into();
        assert!(matches!(
            store.update(a.clone()).await,
            Err(StoreError::DuplicateContainer(_))
        ));

        a.container_number = "MSCU0000003".into();
        store.update(a).await.unwrap();
        assert!(!store.exists_by_container_number("MSCU0000001").await.unwrap());
        assert!(store.exists_by_container_number("MSCU0000003").await.unwrap());
    }

    #[tokio::test]
    async fn created_range_is_half_open() {
        let store = WalStore::open(test_wal_path("range.wal")).unwrap();
        store.insert(draft("C1", "2024-03-09T23:59:00")).await.unwrap();
        store.insert(draft("C2", "2024-03-10T00:00:00")).await.unwrap();
        store.insert(draft("C3", "2024-03-10T23:59:59")).await.unwrap();
        store.insert(draft("C4", "2024-03-11T00:00:00")).await.unwrap();

        let mut hits: Vec<String> = store
            .query_by_created_range(ts("2024-03-10T00:00:00"), ts("2024-03-11T00:00:00"))
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.container_number)
            .collect();
        hits.sort();
        assert_eq!(hits, vec!["C2", "C3"]);
    }

    #[tokio::test]
    async fn replay_restores_state_and_sequence() {
        let path = test_wal_path("replay.wal");
        let approved_id;
        {
            let store = WalStore::open(path.clone()).unwrap();
            let a = store.insert(draft("MSCU0000001", "2024-03-10T08:00:00")).await.unwrap();
            let b = store.insert(draft("MSCU0000002", "2024-03-10T09:00:00")).await.unwrap();
            let mut approved = a.clone();
            approved.status = AppointmentStatus::Approved;
            store.update(approved).await.unwrap();
            store.delete(b.id).await.unwrap();
            approved_id = a.id;
        }

        let store = WalStore::open(path).unwrap();
        assert_eq!(store.len(), 1);
        let a = store.find_by_id(approved_id).await.unwrap().unwrap();
        assert_eq!(a.status, AppointmentStatus::Approved);
        assert!(store.exists_by_container_number("MSCU0000001").await.unwrap());
        assert!(!store.exists_by_container_number("MSCU0000002").await.unwrap());

        let c = store.insert(draft("MSCU0000003", "2024-03-10T10:00:00")).await.unwrap();
        assert_eq!(c.id, AppointmentId(3));
    }

    #[tokio::test]
    async fn compaction_keeps_state_and_never_reuses_ids() {
        let path = test_wal_path("compact.wal");
        {
            let store = WalStore::open(path.clone()).unwrap();
            let mut last = None;
            for i in 0..10 {
                let a = store
                    .insert(draft(&format!("TGHU000000{i}"), "2024-03-10T08:00:00"))
                    .await
                    .unwrap();
                last = Some(a.id);
            }
            // keep only the first; the highest id is deleted
            for id in 2..=10 {
                store.delete(AppointmentId(id)).await.unwrap();
            }
            assert_eq!(last, Some(AppointmentId(10)));
            assert_eq!(store.appends_since_compact().await, 19);

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let store = WalStore::open(path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.find_by_id(AppointmentId(1)).await.unwrap().is_some());
        let next = store.insert(draft("MSCU7777777", "2024-03-12T08:00:00")).await.unwrap();
        assert_eq!(next.id, AppointmentId(11));
    }
}
