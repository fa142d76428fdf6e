//! Descriptor validation
//!
//! Cross-service checks that a single field cannot express: every reference
//! resolves, the dependency graph is acyclic, and no two mappings claim the
//! same host port or container path.

use super::model::{Descriptor, PortMapping};
use crate::error::{KeelError, Result};
use std::collections::{BTreeMap, HashMap};

/// DFS visit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    InProgress,
    Done,
}

/// Descriptor validator
pub struct DescriptorValidator;

impl DescriptorValidator {
    /// Validate a descriptor. Fails on the first problem found.
    pub fn validate(descriptor: &Descriptor) -> Result<()> {
        Self::check_dependencies(descriptor)?;
        Self::check_volumes(descriptor)?;
        Self::check_cycles(descriptor)?;
        Self::check_ports(descriptor)?;
        Self::check_mount_targets(descriptor)?;

        tracing::debug!(
            "Descriptor valid: {} services, {} volumes",
            descriptor.len(),
            descriptor.volumes().count()
        );
        Ok(())
    }

    /// Every dependency names a declared service
    pub fn check_dependencies(descriptor: &Descriptor) -> Result<()> {
        for service in descriptor.services() {
            for dep in service.dependencies() {
                if !descriptor.contains_service(dep) {
                    return Err(KeelError::DanglingDependency {
                        service: service.name().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Every named-volume mount references a declared volume
    pub fn check_volumes(descriptor: &Descriptor) -> Result<()> {
        for service in descriptor.services() {
            for mount in service.volume_mounts() {
                if let Some(volume) = mount.volume_name() {
                    if !descriptor.contains_volume(volume) {
                        return Err(KeelError::DanglingVolume {
                            service: service.name().to_string(),
                            volume: volume.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Depth-first search for a back edge. Assumes dependencies resolve.
    pub fn check_cycles(descriptor: &Descriptor) -> Result<()> {
        let mut state: BTreeMap<&str, Visit> = descriptor
            .services()
            .map(|s| (s.name(), Visit::Unvisited))
            .collect();
        let mut stack: Vec<&str> = Vec::new();

        for service in descriptor.services() {
            if state.get(service.name()) == Some(&Visit::Unvisited) {
                Self::visit(descriptor, service.name(), &mut state, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        descriptor: &'a Descriptor,
        name: &'a str,
        state: &mut BTreeMap<&'a str, Visit>,
        stack: &mut Vec<&'a str>,
    ) -> Result<()> {
        state.insert(name, Visit::InProgress);
        stack.push(name);

        if let Some(service) = descriptor.service(name) {
            for dep in service.dependencies() {
                match state.get(dep.as_str()).copied() {
                    Some(Visit::Unvisited) => Self::visit(descriptor, dep, state, stack)?,
                    Some(Visit::InProgress) => {
                        let start = stack.iter().position(|s| *s == dep.as_str()).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.clone());
                        return Err(KeelError::DependencyCycle { path });
                    }
                    // Done, or undeclared (reported by check_dependencies)
                    Some(Visit::Done) | None => {}
                }
            }
        }

        stack.pop();
        state.insert(name, Visit::Done);
        Ok(())
    }

    /// No two mappings bind the same host socket
    pub fn check_ports(descriptor: &Descriptor) -> Result<()> {
        let mut seen: Vec<(&str, &PortMapping)> = Vec::new();

        for service in descriptor.services() {
            for port in service.ports() {
                if let Some((owner, _)) = seen.iter().find(|(_, other)| other.conflicts_with(port)) {
                    return Err(KeelError::PortConflict {
                        binding: port.host_binding().unwrap_or_else(|| port.to_string()),
                        first: owner.to_string(),
                        second: service.name().to_string(),
                    });
                }
                seen.push((service.name(), port));
            }
        }
        Ok(())
    }

    /// A service mounts at most one source per container path
    pub fn check_mount_targets(descriptor: &Descriptor) -> Result<()> {
        for service in descriptor.services() {
            let mut targets: HashMap<&str, String> = HashMap::new();
            for mount in service.volume_mounts() {
                let target = mount.target.trim_end_matches('/');
                if let Some(first) = targets.get(target) {
                    return Err(KeelError::VolumeConflict {
                        service: service.name().to_string(),
                        target: mount.target.clone(),
                        first: first.clone(),
                        second: mount.source.to_string(),
                    });
                }
                targets.insert(target, mount.source.to_string());
            }
        }
        Ok(())
    }
}
