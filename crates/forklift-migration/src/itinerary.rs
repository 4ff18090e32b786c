//! Per-VM itineraries
//!
//! Cold: `Started → PreHook? → Inspecting? → TransferringDisks → Converting?
//! → CreatingTarget → PostHook? → Completed`. Warm inserts `InitialCopy →
//! IncrementalCopy → Cutover` after `TransferringDisks`.

use forklift_common::crd::{PlanVm, ProviderType, VmPhase, STEP_POST_HOOK, STEP_PRE_HOOK};

/// Which optional phases a VM goes through
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Itinerary {
    /// Incremental copies with a cutover
    pub warm: bool,
    /// Guest inspection and conversion
    pub guest_conversion: bool,
    /// A pre-migration hook is bound
    pub pre_hook: bool,
    /// A post-migration hook is bound
    pub post_hook: bool,
}

impl Itinerary {
    /// Itinerary of a plan VM migrated from a provider of `source` type
    pub fn of(vm: &PlanVm, source: ProviderType, warm: bool) -> Self {
        Self {
            warm,
            guest_conversion: source.capabilities().guest_conversion,
            pre_hook: vm.hook_for(STEP_PRE_HOOK).is_some(),
            post_hook: vm.hook_for(STEP_POST_HOOK).is_some(),
        }
    }

    /// Phases in order, from `Started` to `Completed`
    pub fn phases(&self) -> Vec<VmPhase> {
        let mut phases = vec![VmPhase::Started];
        if self.pre_hook {
            phases.push(VmPhase::PreHook);
        }
        if self.guest_conversion {
            phases.push(VmPhase::Inspecting);
        }
        phases.push(VmPhase::TransferringDisks);
        if self.warm {
            phases.extend([VmPhase::InitialCopy, VmPhase::IncrementalCopy, VmPhase::Cutover]);
        }
        if self.guest_conversion {
            phases.push(VmPhase::Converting);
        }
        phases.push(VmPhase::CreatingTarget);
        if self.post_hook {
            phases.push(VmPhase::PostHook);
        }
        phases.push(VmPhase::Completed);
        phases
    }

    /// Phase after `current`. `Pending` starts at `Started`; terminal phases
    /// and phases not on this itinerary stay put.
    pub fn next(&self, current: VmPhase) -> VmPhase {
        if current == VmPhase::Pending {
            return VmPhase::Started;
        }
        let phases = self.phases();
        phases
            .iter()
            .position(|p| *p == current)
            .and_then(|i| phases.get(i + 1).copied())
            .unwrap_or(current)
    }

    /// `phase` is on this itinerary
    pub fn has(&self, phase: VmPhase) -> bool {
        self.phases().contains(&phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::HookRef;
    use forklift_common::refs::{ObjectRef, Ref};
    use rstest::rstest;
    use VmPhase::*;

    fn walk(itinerary: Itinerary) -> Vec<VmPhase> {
        let mut phases = vec![];
        let mut phase = Pending;
        loop {
            let next = itinerary.next(phase);
            if next == phase {
                return phases;
            }
            phases.push(next);
            phase = next;
        }
    }

    #[rstest]
    #[case::cold_plain(
        Itinerary::default(),
        vec![Started, TransferringDisks, CreatingTarget, Completed]
    )]
    #[case::cold_converted_with_hooks(
        Itinerary { guest_conversion: true, pre_hook: true, post_hook: true, ..Default::default() },
        vec![Started, PreHook, Inspecting, TransferringDisks, Converting, CreatingTarget, PostHook, Completed]
    )]
    #[case::warm(
        Itinerary { warm: true, guest_conversion: true, ..Default::default() },
        vec![Started, Inspecting, TransferringDisks, InitialCopy, IncrementalCopy, Cutover, Converting, CreatingTarget, Completed]
    )]
    fn phases_in_order(#[case] itinerary: Itinerary, #[case] expected: Vec<VmPhase>) {
        assert_eq!(walk(itinerary), expected);
    }

    #[test]
    fn terminal_and_foreign_phases_stay() {
        let cold = Itinerary::default();
        assert_eq!(cold.next(Completed), Completed);
        assert_eq!(cold.next(Canceled), Canceled);
        assert_eq!(cold.next(Cutover), Cutover);
        assert!(!cold.has(Cutover));
    }

    #[test]
    fn derived_from_plan_vm_and_provider() {
        let vm = PlanVm {
            source: Ref::with_id("vm-1"),
            target_name: None,
            hooks: vec![HookRef {
                step: STEP_POST_HOOK.into(),
                hook: ObjectRef::new("forklift", "notify"),
            }],
        };
        let it = Itinerary::of(&vm, ProviderType::VSphere, true);
        assert!(it.warm && it.guest_conversion && it.post_hook && !it.pre_hook);

        let it = Itinerary::of(&vm, ProviderType::OVirt, false);
        assert!(!it.guest_conversion);
    }
}
