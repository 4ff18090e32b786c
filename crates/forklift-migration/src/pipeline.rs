//! Per-VM pipeline steps and progress roll-up

use forklift_common::crd::{Progress, Task, VmPhase, VmStatus};
use forklift_common::inventory::Vm;

use crate::itinerary::Itinerary;

/// Admission, power state and inspection
pub const INITIALIZE: &str = "Initialize";
/// Pre-migration hook
pub const PRE_HOOK: &str = "PreHook";
/// Disk copies, one sub-task per disk
pub const DISK_TRANSFER: &str = "DiskTransfer";
/// Warm final copy
pub const CUTOVER: &str = "Cutover";
/// Guest conversion
pub const IMAGE_CONVERSION: &str = "ImageConversion";
/// Target VM creation
pub const VM_CREATION: &str = "VirtualMachineCreation";
/// Post-migration hook
pub const POST_HOOK: &str = "PostHook";

/// Units of disk transfer progress
pub const MB: &str = "MB";

const MIB: i64 = 1 << 20;

/// Ordered steps for a VM
pub fn build(itinerary: &Itinerary, vm: &Vm) -> Vec<Task> {
    let mut steps = vec![Task::new(INITIALIZE, "Initialize migration.", 1, "")];
    if itinerary.pre_hook {
        steps.push(Task::new(PRE_HOOK, "Run pre-migration hook.", 1, ""));
    }

    let mut transfer = Task::new(DISK_TRANSFER, "Transfer disks.", 0, MB);
    transfer.tasks = vm
        .disks
        .iter()
        .map(|d| Task::new(&d.id, format!("Transfer disk {}.", d.id), d.capacity / MIB, MB))
        .collect();
    transfer.progress.total = transfer.tasks.iter().map(|t| t.progress.total).sum();
    steps.push(transfer);

    if itinerary.warm {
        steps.push(Task::new(CUTOVER, "Finalize disk transfer.", 1, ""));
    }
    if itinerary.guest_conversion {
        steps.push(Task::new(IMAGE_CONVERSION, "Convert image to target format.", 1, ""));
    }
    steps.push(Task::new(VM_CREATION, "Create VM.", 1, ""));
    if itinerary.post_hook {
        steps.push(Task::new(POST_HOOK, "Run post-migration hook.", 1, ""));
    }
    steps
}

/// Step a phase works on
pub fn step_for(phase: VmPhase) -> Option<&'static str> {
    Some(match phase {
        VmPhase::Started | VmPhase::Inspecting => INITIALIZE,
        VmPhase::PreHook => PRE_HOOK,
        VmPhase::TransferringDisks | VmPhase::InitialCopy | VmPhase::IncrementalCopy => {
            DISK_TRANSFER
        }
        VmPhase::Cutover => CUTOVER,
        VmPhase::Converting => IMAGE_CONVERSION,
        VmPhase::CreatingTarget => VM_CREATION,
        VmPhase::PostHook => POST_HOOK,
        VmPhase::Pending | VmPhase::Completed | VmPhase::Canceled => return None,
    })
}

/// Record bytes copied for a disk. Unknown disks are ignored.
pub fn record_disk(vm: &mut VmStatus, disk_id: &str, transferred: u64, total: u64) {
    let Some(disk) = vm
        .find_step_mut(DISK_TRANSFER)
        .and_then(|s| s.find_task_mut(disk_id))
    else {
        return;
    };
    if total > 0 {
        disk.progress.total = to_mb(total);
    }
    disk.progress.completed = to_mb(transferred).min(disk.progress.total.max(0));
    disk.mark_started();
    if total > 0 && transferred >= total {
        disk.mark_completed();
    }
}

/// Every disk sub-task has completed
pub fn disks_transferred(vm: &VmStatus) -> bool {
    vm.find_step(DISK_TRANSFER)
        .is_some_and(|s| s.tasks.iter().all(Task::is_completed))
}

/// Complete every disk sub-task (copy finished as a whole)
pub fn complete_disks(vm: &mut VmStatus) {
    if let Some(step) = vm.find_step_mut(DISK_TRANSFER) {
        for disk in &mut step.tasks {
            disk.progress.completed = disk.progress.total;
            disk.mark_completed();
        }
    }
}

/// Mark the step of the current phase as running
pub fn start_step(vm: &mut VmStatus) {
    if let Some(name) = step_for(vm.phase) {
        if let Some(step) = vm.find_step_mut(name) {
            step.mark_started();
        }
    }
}

/// Complete a step, filling its progress
pub fn complete_step(vm: &mut VmStatus, name: &str) {
    if let Some(step) = vm.find_step_mut(name) {
        if step.tasks.is_empty() {
            step.progress.completed = step.progress.total;
        }
        step.mark_completed();
    }
}

/// Record an error on the step of the current phase and roll it up
pub fn fail_step(vm: &mut VmStatus, reasons: impl IntoIterator<Item = impl Into<String>>) {
    let phase = format!("{:?}", vm.phase);
    let step_name = step_for(vm.phase).unwrap_or(INITIALIZE);
    match vm.find_step_mut(step_name) {
        Some(step) => {
            step.add_error(phase, reasons);
            step.mark_completed();
        }
        None => vm.add_error(phase, reasons),
    }
    vm.reflect();
}

/// Sum disk transfer progress over VMs
pub fn aggregate(vms: &[VmStatus]) -> Progress {
    vms.iter().map(|v| v.progress(MB)).fold(
        Progress {
            units: MB.to_string(),
            ..Default::default()
        },
        |mut acc, p| {
            acc.completed += p.completed;
            acc.total += p.total;
            acc
        },
    )
}

fn to_mb(bytes: u64) -> i64 {
    i64::try_from(bytes / MIB as u64).unwrap_or(i64::MAX)
}
