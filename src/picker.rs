use crate::inventory::HostHandle;
use rand::Rng;
use rand::seq::SliceRandom;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoEligibleTarget;

impl fmt::Display for NoEligibleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no eligible target host")
    }
}

/// Uniform random destination choice.
///
/// The current host is excluded when it is known and part of the host set;
/// otherwise every host is eligible. Picks carry no memory between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct TargetPicker;

impl TargetPicker {
    pub fn new() -> Self {
        Self
    }

    pub fn pick(
        &self,
        current: Option<&HostHandle>,
        hosts: &[HostHandle],
    ) -> Result<HostHandle, NoEligibleTarget> {
        self.pick_with(&mut rand::thread_rng(), current, hosts)
    }

    pub fn pick_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        current: Option<&HostHandle>,
        hosts: &[HostHandle],
    ) -> Result<HostHandle, NoEligibleTarget> {
        let eligible: Vec<&HostHandle> = match current {
            Some(current) if hosts.contains(current) => {
                hosts.iter().filter(|host| *host != current).collect()
            }
            _ => hosts.iter().collect(),
        };

        eligible
            .choose(rng)
            .map(|host| (*host).clone())
            .ok_or(NoEligibleTarget)
    }
}
