//! Per-tick migration engine
//!
//! A tick never blocks on external work. It admits VMs, applies
//! cancellations, lets the scheduler start at most one VM and moves every
//! running VM at most one phase forward. Workers, hooks and the target
//! platform are only polled; the next tick observes their progress.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use forklift_common::condition::{reason, Category, Condition};
use forklift_common::crd::{
    Migration, MigrationStatus, PlanVm, Precopy, VmPhase, VmStatus, STEP_POST_HOOK, STEP_PRE_HOOK,
};
use forklift_common::inventory::{find_vm, InventoryProvider, Lookup, Vm};
use forklift_common::refs::Ref;
use forklift_common::Error;

use crate::builder::{self, Render};
use crate::controller::Context;
use crate::hook_runner::{HookOutcome, HookRequest};
use crate::inspection::OsFamily;
use crate::itinerary::Itinerary;
use crate::pipeline;
use crate::scheduler::Scheduler;
use crate::snapshot::Resolved;
use crate::worker::{Completion, DiskProgress, Stage, WorkerHandle, WorkerRequest, WorkerStatus};

/// Consecutive failed warm copies tolerated before the VM fails
pub const MAX_PRECOPY_FAILURES: u32 = 3;

const NOT_IN_INVENTORY: &str = "VM not found in inventory.";

/// Result of working on a phase
#[derive(Debug, PartialEq)]
enum Step {
    /// Nothing to do until the next tick
    Wait,
    /// Phase finished
    Done,
    /// Phase failed
    Failed(Vec<String>),
}

/// One reconcile tick of a migration
pub struct Engine<'a> {
    ctx: &'a Context,
    migration: &'a Migration,
    resolved: &'a Resolved<'a>,
    provider: InventoryProvider,
    warm: bool,
    now: DateTime<Utc>,
}

impl<'a> Engine<'a> {
    /// Engine for `migration` executing the resolved plan
    pub fn new(
        ctx: &'a Context,
        migration: &'a Migration,
        resolved: &'a Resolved<'a>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ctx,
            migration,
            resolved,
            provider: InventoryProvider::of(resolved.source),
            warm: resolved.plan.is_warm(),
            now,
        }
    }

    /// Run one tick. `others` are the other active migrations sharing the
    /// source provider.
    pub async fn run(&self, status: &mut MigrationStatus, others: &[Migration]) -> Result<(), Error> {
        if status.vms.is_empty() {
            self.admit(status).await?;
        }
        self.cancel(status).await?;

        let scheduler = Scheduler {
            inventory: self.ctx.inventory.as_ref(),
            provider: &self.provider,
            max_inflight: self.ctx.settings.max_vm_inflight,
        };
        if let Some(next) = scheduler.next(&status.vms, others).await? {
            if let Some(vm) = status.find_vm_mut(&next) {
                vm.started = Some(self.now);
                vm.phase = VmPhase::Started;
                info!(vm = %vm.source, "vm admitted by scheduler");
            }
        }

        for vm in status.vms.iter_mut().filter(|v| v.is_running()) {
            let source = match find_vm(self.ctx.inventory.as_ref(), &self.provider, &vm.source).await? {
                Lookup::Found(source) => source,
                Lookup::NotFound | Lookup::Ambiguous => {
                    self.fail(vm, vec![NOT_IN_INVENTORY.to_string()]).await?;
                    continue;
                }
            };
            match self.advance(vm, &source).await {
                Ok(()) => {}
                Err(e) if is_step_error(&e) => self.fail(vm, vec![e.to_string()]).await?,
                Err(e) => return Err(e),
            }
        }

        status.progress = Some(pipeline::aggregate(&status.vms));
        Ok(())
    }

    /// Create a pending status for every plan VM
    async fn admit(&self, status: &mut MigrationStatus) -> Result<(), Error> {
        for plan_vm in &self.resolved.plan.spec.vms {
            let lookup =
                find_vm(self.ctx.inventory.as_ref(), &self.provider, &plan_vm.source).await?;
            let vm = match lookup {
                Lookup::Found(found) => VmStatus::new(
                    Ref {
                        id: found.id.clone(),
                        name: found.name.clone(),
                        namespace: found.namespace.clone(),
                        ..Default::default()
                    },
                    forklift_plan::validation::target_name(plan_vm, &found),
                ),
                missing => {
                    let mut vm = VmStatus::new(
                        plan_vm.source.clone(),
                        plan_vm.target_name.clone().unwrap_or_default(),
                    );
                    let message = if missing == Lookup::Ambiguous {
                        "VM matches more than one inventory VM."
                    } else {
                        NOT_IN_INVENTORY
                    };
                    vm.add_error(format!("{:?}", VmPhase::Pending), [message]);
                    vm.finish(VmPhase::Completed);
                    vm
                }
            };
            status.vms.push(vm);
        }
        info!(vms = status.vms.len(), "vm statuses created");
        Ok(())
    }

    async fn cancel(&self, status: &mut MigrationStatus) -> Result<(), Error> {
        for vm in status
            .vms
            .iter_mut()
            .filter(|v| !v.is_completed() && self.migration.is_canceled(v))
        {
            if vm.started.is_some() {
                self.release(vm).await?;
            }
            vm.finish(VmPhase::Canceled);
            info!(vm = %vm.source, "vm canceled");
        }
        Ok(())
    }

    async fn advance(&self, vm: &mut VmStatus, source: &Vm) -> Result<(), Error> {
        let plan_vm = self.plan_vm(vm);
        let itinerary = Itinerary::of(&plan_vm, self.resolved.source.spec.type_, self.warm);
        if vm.pipeline.is_empty() {
            vm.pipeline = pipeline::build(&itinerary, source);
        }
        pipeline::start_step(vm);

        let step = match vm.phase {
            VmPhase::Started => {
                vm.restore_power_state.get_or_insert(source.power());
                Step::Done
            }
            VmPhase::PreHook => self.run_hook(vm, &plan_vm, STEP_PRE_HOOK).await?,
            VmPhase::Inspecting => self.inspect(vm, source, &itinerary).await?,
            VmPhase::TransferringDisks => self.transfer(vm, source, &itinerary).await?,
            VmPhase::InitialCopy | VmPhase::IncrementalCopy => self.precopy(vm, source).await?,
            VmPhase::Cutover => self.cutover(vm, source).await?,
            VmPhase::Converting => self.convert(vm, source, &itinerary).await?,
            VmPhase::CreatingTarget => self.create_target(vm, source, &itinerary).await?,
            VmPhase::PostHook => self.run_hook(vm, &plan_vm, STEP_POST_HOOK).await?,
            VmPhase::Pending | VmPhase::Completed | VmPhase::Canceled => Step::Wait,
        };

        match step {
            Step::Wait => vm.reflect(),
            Step::Done => self.next_phase(vm, &itinerary).await?,
            Step::Failed(reasons) => self.fail(vm, reasons).await?,
        }
        Ok(())
    }

    async fn next_phase(&self, vm: &mut VmStatus, itinerary: &Itinerary) -> Result<(), Error> {
        let leaving = pipeline::step_for(vm.phase);
        let from = vm.phase;
        vm.phase = itinerary.next(vm.phase);
        if let Some(step) = leaving.filter(|s| Some(*s) != pipeline::step_for(vm.phase)) {
            pipeline::complete_step(vm, step);
        }
        vm.reflect();
        debug!(vm = %vm.source, ?from, to = ?vm.phase, "vm phase advanced");

        if vm.phase == VmPhase::Completed {
            self.release(vm).await?;
            vm.finish(VmPhase::Completed);
            info!(vm = %vm.source, target = %vm.target_name, "vm migrated");
        } else {
            pipeline::start_step(vm);
        }
        Ok(())
    }

    async fn fail(&self, vm: &mut VmStatus, reasons: Vec<String>) -> Result<(), Error> {
        warn!(vm = %vm.source, phase = ?vm.phase, ?reasons, "vm migration failed");
        self.release(vm).await?;
        pipeline::fail_step(vm, reasons);
        vm.finish(VmPhase::Completed);
        Ok(())
    }

    /// Remove every worker the VM may have started
    async fn release(&self, vm: &VmStatus) -> Result<(), Error> {
        for stage in stages(vm) {
            self.ctx.worker.release(&self.handle(vm, stage)).await?;
        }
        Ok(())
    }

    async fn run_hook(&self, vm: &VmStatus, plan_vm: &PlanVm, step: &str) -> Result<Step, Error> {
        let Some(hook_ref) = plan_vm.hook_for(step) else {
            return Ok(Step::Done);
        };
        let plan = self.resolved.plan;
        let plan_namespace = plan.namespace().unwrap_or_default();
        let hook_ref = hook_ref.or_namespace(&plan_namespace);
        let Some(hook) = self
            .ctx
            .kube
            .get_hook(&hook_ref.name, &hook_ref.namespace)
            .await?
        else {
            return Ok(Step::Failed(vec![format!("Hook {hook_ref} not found.")]));
        };

        let request = HookRequest {
            hook,
            step: step.to_string(),
            migration: self.migration.name_any(),
            namespace: self.migration.namespace().unwrap_or_default(),
            migration_uid: self.migration.uid().unwrap_or_default(),
            plan: plan.name_any(),
            plan_uid: plan.uid().unwrap_or_default(),
            vm: vm.source.clone(),
            target_name: vm.target_name.clone(),
            target_namespace: plan.spec.target_namespace.clone(),
            default_image: self.ctx.settings.hook_image.clone(),
        };
        Ok(match self.ctx.hooks.run(&request).await? {
            HookOutcome::Running => Step::Wait,
            HookOutcome::Succeeded => Step::Done,
            HookOutcome::Failed(reasons) => Step::Failed(reasons),
        })
    }

    async fn inspect(
        &self,
        vm: &mut VmStatus,
        source: &Vm,
        itinerary: &Itinerary,
    ) -> Result<Step, Error> {
        let stage = if itinerary.warm {
            Stage::Precopy(0)
        } else {
            Stage::Transfer
        };
        self.launch(vm, source, stage, false).await?;
        let handle = self.handle(vm, stage);
        if let Some(WorkerStatus {
            completion: Some(Completion::Failed(reasons)),
            ..
        }) = self.ctx.worker.status(&handle).await?
        {
            return Ok(Step::Failed(reasons));
        }
        Ok(match self.ctx.worker.inspection(&handle).await? {
            Some(os) => {
                info!(vm = %vm.source, os = %os.osinfo, family = ?os.family(), "guest inspected");
                vm.operating_system = Some(os.osinfo);
                Step::Done
            }
            None => Step::Wait,
        })
    }

    async fn transfer(
        &self,
        vm: &mut VmStatus,
        source: &Vm,
        itinerary: &Itinerary,
    ) -> Result<Step, Error> {
        if itinerary.warm {
            let warm = vm.warm.get_or_insert_with(Default::default);
            if warm.precopies.is_empty() {
                warm.precopies.push(Precopy {
                    start: Some(self.now),
                    end: None,
                });
            }
            self.launch(vm, source, Stage::Precopy(0), false).await?;
            return Ok(Step::Done);
        }

        self.launch(vm, source, Stage::Transfer, false).await?;
        let Some(status) = self.ctx.worker.status(&self.handle(vm, Stage::Transfer)).await? else {
            return Ok(Step::Wait);
        };
        record(vm, &status.progress);
        Ok(match status.completion {
            Some(Completion::Failed(reasons)) => Step::Failed(reasons),
            Some(Completion::Succeeded) => {
                pipeline::complete_disks(vm);
                Step::Done
            }
            // the worker goes on converting once every disk is copied
            None if itinerary.guest_conversion && pipeline::disks_transferred(vm) => Step::Done,
            None => Step::Wait,
        })
    }

    /// Initial and incremental warm copies
    async fn precopy(&self, vm: &mut VmStatus, source: &Vm) -> Result<Step, Error> {
        let warm = vm.warm.get_or_insert_with(Default::default);
        let copying = warm.precopies.last().is_some_and(|p| p.end.is_none());
        let current = Stage::Precopy(u32::try_from(warm.precopies.len().saturating_sub(1)).unwrap_or(u32::MAX));

        if copying {
            let handle = self.handle(vm, current);
            let Some(status) = self.ctx.worker.status(&handle).await? else {
                self.launch(vm, source, current, false).await?;
                return Ok(Step::Wait);
            };
            if vm.phase == VmPhase::InitialCopy {
                record(vm, &status.progress);
            }
            let interval = chrono::Duration::from_std(self.ctx.settings.precopy_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            match status.completion {
                None => return Ok(Step::Wait),
                Some(Completion::Failed(reasons)) => {
                    self.ctx.worker.release(&handle).await?;
                    let warm = vm.warm.get_or_insert_with(Default::default);
                    close_precopy(warm.precopies.last_mut(), self.now);
                    warm.failures += 1;
                    warm.next_precopy_at = Some(self.now);
                    warn!(vm = %vm.source, failures = warm.failures, ?reasons, "warm copy failed");
                    if warm.failures >= MAX_PRECOPY_FAILURES {
                        return Ok(Step::Failed(reasons));
                    }
                    return Ok(Step::Wait);
                }
                Some(Completion::Succeeded) => {
                    self.ctx.worker.release(&handle).await?;
                    let warm = vm.warm.get_or_insert_with(Default::default);
                    close_precopy(warm.precopies.last_mut(), self.now);
                    warm.failures = 0;
                    warm.next_precopy_at = Some(self.now + interval);
                    info!(vm = %vm.source, copies = warm.precopies.len(), "warm copy completed");
                    if vm.phase == VmPhase::InitialCopy {
                        pipeline::complete_disks(vm);
                        return Ok(Step::Done);
                    }
                }
            }
        }

        if vm.phase == VmPhase::IncrementalCopy && self.migration.cutover_due(self.now) {
            return Ok(Step::Done);
        }
        let warm = vm.warm.get_or_insert_with(Default::default);
        if warm.next_precopy_at.is_some_and(|at| at > self.now) {
            return Ok(Step::Wait);
        }
        warm.precopies.push(Precopy {
            start: Some(self.now),
            end: None,
        });
        let next = Stage::Precopy(u32::try_from(warm.precopies.len() - 1).unwrap_or(u32::MAX));
        self.launch(vm, source, next, false).await?;
        Ok(Step::Wait)
    }

    /// Final warm copy with the source powered off
    async fn cutover(&self, vm: &mut VmStatus, source: &Vm) -> Result<Step, Error> {
        self.launch(vm, source, Stage::Cutover, true).await?;
        let Some(status) = self.ctx.worker.status(&self.handle(vm, Stage::Cutover)).await? else {
            return Ok(Step::Wait);
        };
        Ok(match status.completion {
            None => Step::Wait,
            Some(Completion::Failed(reasons)) => Step::Failed(reasons),
            Some(Completion::Succeeded) => {
                info!(vm = %vm.source, "cutover copy completed");
                Step::Done
            }
        })
    }

    async fn convert(
        &self,
        vm: &mut VmStatus,
        source: &Vm,
        itinerary: &Itinerary,
    ) -> Result<Step, Error> {
        let stage = conversion_stage(itinerary);
        if stage == Stage::Convert {
            self.launch(vm, source, stage, false).await?;
        }
        let Some(status) = self.ctx.worker.status(&self.handle(vm, stage)).await? else {
            return Ok(Step::Wait);
        };
        Ok(match status.completion {
            None => Step::Wait,
            Some(Completion::Failed(reasons)) => Step::Failed(reasons),
            Some(Completion::Succeeded) => Step::Done,
        })
    }

    async fn create_target(
        &self,
        vm: &mut VmStatus,
        source: &Vm,
        itinerary: &Itinerary,
    ) -> Result<Step, Error> {
        let namespace = &self.resolved.plan.spec.target_namespace;
        let handle = self.handle(vm, conversion_stage(itinerary));

        if !self.ctx.target.exists(namespace, &vm.target_name).await? {
            let render = Render {
                vm: source,
                status: vm,
                namespace,
                network_map: self.resolved.network_map,
                storage_map: self.resolved.storage_map,
                migration_uid: &self.migration.uid().unwrap_or_default(),
                plan_uid: &self.resolved.plan.uid().unwrap_or_default(),
            };
            let rendered = if itinerary.guest_conversion {
                self.ctx.worker.rendered_vm(&handle).await?
            } else {
                None
            };
            let object = match rendered {
                Some(rendered) => builder::adopt(rendered, &render)?,
                None => builder::build(&render)?,
            };
            self.ctx.target.create_vm(namespace, &object).await?;
            info!(vm = %vm.source, target = %vm.target_name, namespace = %namespace, "target vm created");
        }

        if itinerary.guest_conversion {
            for warning in self.ctx.worker.warnings(&handle).await? {
                vm.conditions.set_condition(Condition::new(
                    warning.reason,
                    Category::Warn,
                    reason::COMPLETED,
                    warning.message,
                ));
            }
            self.ctx.worker.shutdown(&handle).await?;
        }
        Ok(Step::Done)
    }

    async fn launch(
        &self,
        vm: &VmStatus,
        source: &Vm,
        stage: Stage,
        power_off_source: bool,
    ) -> Result<(), Error> {
        let provider = self.resolved.source;
        let request = WorkerRequest {
            handle: self.handle(vm, stage),
            stage,
            migration_uid: self.migration.uid().unwrap_or_default(),
            plan_uid: self.resolved.plan.uid().unwrap_or_default(),
            source_type: provider.spec.type_,
            source_url: provider.spec.url.clone(),
            secret: provider
                .spec
                .secret
                .or_namespace(&provider.namespace().unwrap_or_default()),
            vm: source.clone(),
            target_name: vm.target_name.clone(),
            power_off_source,
            os_family: vm.operating_system.as_deref().map(OsFamily::of),
        };
        self.ctx.worker.launch(&request).await
    }

    fn handle(&self, vm: &VmStatus, stage: Stage) -> WorkerHandle {
        let vm_id = if vm.source.id.is_empty() {
            &vm.source.name
        } else {
            &vm.source.id
        };
        WorkerHandle::new(
            &self.resolved.plan.spec.target_namespace,
            &self.migration.uid().unwrap_or_default(),
            vm_id,
            stage,
        )
    }

    /// Plan entry of a VM; a VM removed from the plan mid-run keeps going
    /// without hooks
    fn plan_vm(&self, vm: &VmStatus) -> PlanVm {
        let s = &vm.source;
        self.resolved
            .plan
            .spec
            .vms
            .iter()
            .find(|p| p.source.matches(&s.id, &s.namespace, &s.name))
            .cloned()
            .unwrap_or_else(|| PlanVm {
                source: s.clone(),
                ..Default::default()
            })
    }
}

/// Worker that converts the guest and serves the rendered VM
fn conversion_stage(itinerary: &Itinerary) -> Stage {
    if itinerary.warm {
        Stage::Convert
    } else {
        Stage::Transfer
    }
}

/// Every worker stage a VM may have used
fn stages(vm: &VmStatus) -> Vec<Stage> {
    match &vm.warm {
        Some(warm) => (0..warm.precopies.len())
            .map(|n| Stage::Precopy(u32::try_from(n).unwrap_or(u32::MAX)))
            .chain([Stage::Cutover, Stage::Convert])
            .collect(),
        None => vec![Stage::Transfer],
    }
}

fn record(vm: &mut VmStatus, progress: &[DiskProgress]) {
    for disk in progress {
        pipeline::record_disk(vm, &disk.disk_id, disk.bytes_transferred, disk.total_bytes);
    }
}

fn close_precopy(precopy: Option<&mut Precopy>, now: DateTime<Utc>) {
    if let Some(p) = precopy {
        p.end.get_or_insert(now);
    }
}

/// Collaborator failures end the VM; cluster and inventory hiccups are
/// retried by the reconcile loop
fn is_step_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Worker { .. } | Error::Hook { .. } | Error::Target { .. }
    ) || !error.is_retryable()
}
