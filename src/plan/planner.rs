//! Wave planner

use crate::descriptor::{Descriptor, DescriptorValidator};
use crate::error::{KeelError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Services that may start concurrently. Members are sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Wave(Vec<String>);

impl Wave {
    pub fn services(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.0.iter().any(|s| s == service)
    }
}

impl fmt::Display for Wave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

/// Ordered start waves. Every service's dependencies sit in earlier waves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupPlan {
    waves: Vec<Wave>,
}

impl StartupPlan {
    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    /// Number of waves
    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Total services across all waves
    pub fn service_count(&self) -> usize {
        self.waves.iter().map(Wave::len).sum()
    }

    /// Zero-based wave index of a service
    pub fn wave_of(&self, service: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.contains(service))
    }

    /// Waves in the order services should be stopped
    pub fn shutdown_order(&self) -> impl Iterator<Item = &Wave> {
        self.waves.iter().rev()
    }

    /// Plain nested names, mostly for display and tests
    pub fn to_names(&self) -> Vec<Vec<String>> {
        self.waves.iter().map(|w| w.0.clone()).collect()
    }
}

impl fmt::Display for StartupPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(f, "wave {}: {}", i + 1, wave)?;
        }
        Ok(())
    }
}

/// Startup order planner
pub struct StartupPlanner;

impl StartupPlanner {
    /// Plan every service in the descriptor
    pub fn plan(descriptor: &Descriptor) -> Result<StartupPlan> {
        DescriptorValidator::validate(descriptor)?;
        let all: BTreeSet<&str> = descriptor.services().map(|s| s.name()).collect();
        Ok(Self::layer(descriptor, &all))
    }

    /// Plan the named services plus everything they transitively depend on
    pub fn plan_for(descriptor: &Descriptor, targets: &[String]) -> Result<StartupPlan> {
        if targets.is_empty() {
            return Self::plan(descriptor);
        }

        DescriptorValidator::validate(descriptor)?;

        let mut included: BTreeSet<&str> = BTreeSet::new();
        let mut pending: Vec<&str> = Vec::new();
        for target in targets {
            let service = descriptor
                .service(target)
                .ok_or_else(|| KeelError::ServiceNotFound(target.clone()))?;
            pending.push(service.name());
        }

        while let Some(name) = pending.pop() {
            if !included.insert(name) {
                continue;
            }
            if let Some(service) = descriptor.service(name) {
                pending.extend(service.dependencies().iter().map(String::as_str));
            }
        }

        Ok(Self::layer(descriptor, &included))
    }

    /// Kahn's algorithm, one wave per round of zero in-degree extraction
    fn layer(descriptor: &Descriptor, included: &BTreeSet<&str>) -> StartupPlan {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for &name in included {
            let deps = descriptor
                .service(name)
                .map(|s| s.dependencies())
                .unwrap_or_default();
            in_degree.insert(name, deps.len());
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(name);
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut waves = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let mut next = BTreeSet::new();
            for &name in &ready {
                for &dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }

            placed += ready.len();
            let wave = Wave(ready.iter().map(|s| s.to_string()).collect());
            tracing::debug!("Planned wave {}: {}", waves.len() + 1, wave);
            waves.push(wave);
            ready = next;
        }

        // Validation has already rejected cycles
        debug_assert_eq!(placed, included.len(), "unplaced services in an acyclic graph");

        StartupPlan { waves }
    }
}
