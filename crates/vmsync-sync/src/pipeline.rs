//! One sync cycle end to end. Circuits are fetched and upserted, each circuit
//! gets its daily aggregate and possibly a snapshot, and the planner and
//! regional rollups are rebuilt afterwards. A sync log row brackets every run;
//! the cron scheduler drives runs on a timer and a guard rejects overlaps.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use vmsync_adapters::{transform_circuit, InMemoryRegionCache, RegionCache, RegionMap, UnitTypeTable};
use vmsync_core::{
    AggregateData, CircuitAggregate, CircuitUpsert, PlannedUnitsSnapshot, PruneCounts,
    SyncCounters, SyncLog, SyncStatus, SyncTrigger,
};
use vmsync_storage::{
    CircuitStore, PgStore, PipelineStore, RemoteQueryClient, StaticCredentialProvider,
    SyncLogStore,
};

use crate::aggregate::AggregateCalculator;
use crate::config::SyncConfig;
use crate::diff::AggregateStorage;
use crate::queries::WorkStudioQueries;
use crate::snapshot::SnapshotEngine;
use crate::sources::{CircuitSource, PlannedUnitSource, RemoteSource};

pub fn build_remote_client(config: &SyncConfig) -> Result<Arc<RemoteQueryClient>> {
    let credentials = StaticCredentialProvider::single(
        config.remote_username.clone(),
        config.remote_password.clone(),
    );
    let client = RemoteQueryClient::new(config.remote_client_config(), Arc::new(credentials))?;
    Ok(Arc::new(client))
}

pub fn load_unit_types(config: &SyncConfig) -> Result<UnitTypeTable> {
    match &config.unit_types_path {
        Some(path) => UnitTypeTable::from_path(path),
        None => Ok(UnitTypeTable::default()),
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn PipelineStore>,
    circuits: Arc<dyn CircuitSource>,
    calculator: AggregateCalculator,
    aggregates: AggregateStorage,
    snapshots: SnapshotEngine,
    region_cache: Arc<dyn RegionCache>,
    run_guard: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn PipelineStore>,
        circuits: Arc<dyn CircuitSource>,
        units: Arc<dyn PlannedUnitSource>,
        unit_types: UnitTypeTable,
    ) -> Self {
        Self {
            config,
            calculator: AggregateCalculator::new(units, unit_types),
            aggregates: AggregateStorage::new(store.clone()),
            snapshots: SnapshotEngine::new(store.clone()),
            store,
            circuits,
            region_cache: Arc::new(InMemoryRegionCache::new()),
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_region_cache(mut self, region_cache: Arc<dyn RegionCache>) -> Self {
        self.region_cache = region_cache;
        self
    }

    /// Postgres store plus the remote system, both from `config`.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url).await?;
        let client = build_remote_client(&config)?;
        let source = Arc::new(RemoteSource::new(client, Arc::new(WorkStudioQueries)));
        let unit_types = load_unit_types(&config)?;
        Ok(Self::new(
            config,
            Arc::new(store),
            source.clone(),
            source,
            unit_types,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn region_cache(&self) -> &Arc<dyn RegionCache> {
        &self.region_cache
    }

    /// Runs one sync cycle and returns its finalized log. A cycle that fails
    /// still returns `Ok` with a failed log; `Err` means the log itself could
    /// not be written or another run holds the pipeline.
    pub async fn run(
        &self,
        trigger: SyncTrigger,
        status_filter: Option<Vec<String>>,
    ) -> Result<SyncLog> {
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| anyhow!("a sync run is already in progress"))?;

        let status_filter = status_filter
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| self.config.status_filter.clone());
        let mut log = SyncLog::start(trigger, status_filter.clone());
        self.store
            .create_sync_log(&log)
            .await
            .context("creating sync log")?;

        let span = info_span!("sync_run", run_id = %log.id, trigger = trigger.as_str());
        let mut counters = SyncCounters::default();
        let outcome = self
            .run_cycle(&status_filter, &mut counters)
            .instrument(span)
            .await;

        match outcome {
            Ok(()) => log.complete(counters),
            Err(err) => {
                error!(run_id = %log.id, error = %format!("{err:#}"), "sync run failed");
                log.fail(counters, format!("{err:#}"));
            }
        }
        self.store
            .finish_sync_log(&log)
            .await
            .context("finalizing sync log")?;

        if log.status == SyncStatus::Completed {
            info!(
                run_id = %log.id,
                duration_ms = log.duration_ms.unwrap_or_default(),
                circuits = log.counters.circuits_processed,
                aggregates_changed = log.counters.aggregates_changed,
                snapshots = log.counters.snapshots_created,
                "sync run completed"
            );
        }
        Ok(log)
    }

    async fn run_cycle(&self, status_filter: &[String], counters: &mut SyncCounters) -> Result<()> {
        let now = Utc::now();
        let today = now.date_naive();
        let regions = self.regions().await?;

        let rows = self
            .circuits
            .fetch_circuits(status_filter)
            .await
            .context("fetching circuits")?;
        info!(rows = rows.len(), "fetched circuit rows");

        let mut synced: Vec<CircuitUpsert> = Vec::with_capacity(rows.len());
        for row in &rows {
            let partial = transform_circuit(row, &regions);
            match self.store.upsert_circuit(&partial, now).await? {
                Some(upsert) => {
                    counters.circuits_processed += 1;
                    if upsert.created {
                        counters.circuits_created += 1;
                    } else {
                        counters.circuits_updated += 1;
                    }
                    synced.push(upsert);
                }
                None => warn!(
                    job_guid = ?partial.job_guid,
                    work_order = ?partial.work_order,
                    "circuit row lacks identity; skipped"
                ),
            }
        }

        let mut batch = Vec::new();
        for upsert in synced.iter().filter(|u| !u.circuit.is_excluded) {
            let circuit = &upsert.circuit;
            match self.calculator.calculate_for_circuit(circuit).await {
                Ok(calculation) => {
                    batch.push(CircuitAggregate::daily(circuit, today, calculation.data));
                    let trigger = self.snapshots.determine_trigger(upsert, now).await?;
                    if self
                        .snapshots
                        .create_snapshot(circuit, &calculation.rows, trigger)
                        .await?
                        .is_some()
                    {
                        counters.snapshots_created += 1;
                    }
                }
                Err(err) if err.aborts_cycle => return Err(err.into()),
                Err(err) => {
                    counters.aggregates_failed += 1;
                    warn!(
                        circuit_id = %circuit.id,
                        circuit = %circuit.display_key(),
                        reason = %err.reason,
                        "aggregate calculation failed"
                    );
                    batch.push(CircuitAggregate::daily(
                        circuit,
                        today,
                        AggregateData::empty_with_error(err.reason),
                    ));
                }
            }
        }

        let report = self.aggregates.save_batch(&batch).await?;
        counters.aggregates_created += report.created;
        counters.aggregates_updated += report.updated;
        counters.aggregates_changed += report.changed;

        let rollups = self.aggregates.refresh_rollups(today).await?;
        counters.planner_aggregates += rollups.planner;
        counters.regional_aggregates += rollups.regional;
        Ok(())
    }

    async fn regions(&self) -> Result<Arc<RegionMap>> {
        if let Some(cached) = self.region_cache.get() {
            return Ok(cached);
        }
        let regions = self.store.regions().await.context("loading regions")?;
        Ok(self.region_cache.set(RegionMap::from_regions(&regions)))
    }

    /// Captures the circuit's current units regardless of progress or prior hashes.
    pub async fn snapshot_circuit(&self, job_guid: &str) -> Result<PlannedUnitsSnapshot> {
        let Some(circuit) = self.store.circuit_by_job_guid(job_guid).await? else {
            bail!("no circuit with job guid {job_guid}");
        };
        let calculation = self.calculator.calculate_for_circuit(&circuit).await?;
        self.snapshots
            .create_snapshot(&circuit, &calculation.rows, vmsync_core::SnapshotTrigger::Manual)
            .await?
            .ok_or_else(|| anyhow!("manual snapshot for {job_guid} was not persisted"))
    }

    pub async fn prune(&self, days_to_keep: Option<i64>) -> Result<PruneCounts> {
        let days = days_to_keep.unwrap_or(self.config.retention_days);
        self.aggregates
            .prune_old_aggregates(days, Utc::now().date_naive())
            .await
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run(SyncTrigger::Scheduled, None).await {
                    Ok(log) => info!(run_id = %log.id, status = log.status.as_str(), "scheduled sync finished"),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync skipped"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env(trigger: SyncTrigger) -> Result<SyncLog> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run(trigger, None).await
}
