//! Service Descriptor Store
//!
//! Read-only after load. Validation is all-or-nothing: one bad descriptor
//! fails the whole load.

use std::collections::{HashMap, HashSet};

use reqwest::Url;
use warden_shared::{Phase, Result, ServiceCategory, ServiceDescriptor, WardenError};

#[derive(Debug, Clone)]
pub struct DescriptorStore {
    services: Vec<ServiceDescriptor>,
}

impl DescriptorStore {
    /// Validate and order descriptors by phase, keeping declaration order within a phase
    pub fn load(services: Vec<ServiceDescriptor>) -> Result<Self> {
        let problems = validate(&services);
        if !problems.is_empty() {
            return Err(WardenError::Load(problems.join("; ")));
        }

        let mut services = services;
        // sort_by_key is stable, so declaration order survives within a phase
        services.sort_by_key(|s| s.phase);
        Ok(Self { services })
    }

    pub fn list(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn in_phase(&self, phase: Phase) -> impl Iterator<Item = &ServiceDescriptor> + '_ {
        self.services.iter().filter(move |s| s.phase == phase)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn validate(services: &[ServiceDescriptor]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    let phases: HashMap<&str, Phase> = services.iter().map(|s| (s.name.as_str(), s.phase)).collect();

    for (index, svc) in services.iter().enumerate() {
        let label = if svc.name.trim().is_empty() {
            problems.push(format!("service #{} has an empty name", index + 1));
            format!("#{}", index + 1)
        } else {
            svc.name.clone()
        };

        if !svc.name.is_empty() && !seen.insert(svc.name.as_str()) {
            problems.push(format!("duplicate service name '{}'", svc.name));
        }

        if let Err(reason) = check_health_url(&svc.health.url) {
            problems.push(format!("{}: health url {}", label, reason));
        }

        if !Phase::DECLARABLE.contains(&svc.phase) {
            problems.push(format!("{}: phase {} cannot be declared", label, svc.phase));
        }

        match svc.category {
            ServiceCategory::Native => {
                if svc.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    problems.push(format!("{}: native service needs a command", label));
                }
            }
            ServiceCategory::Stack => {
                if svc.stack.is_none() {
                    problems.push(format!("{}: stack service needs a stack reference", label));
                }
            }
            ServiceCategory::External => {}
        }

        for dep in &svc.depends_on {
            match phases.get(dep.as_str()) {
                None => problems.push(format!("{}: depends on unknown service '{}'", label, dep)),
                Some(dep_phase) if *dep_phase > svc.phase => problems.push(format!(
                    "{}: depends on '{}' which starts in a later phase ({})",
                    label, dep, dep_phase
                )),
                Some(_) => {}
            }
        }
    }

    problems
}

fn check_health_url(raw: &str) -> std::result::Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("'{}' is malformed: {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("'{}' must be http or https", raw));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(format!("'{}' has no host", raw));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(name: &str, phase: Phase) -> ServiceDescriptor {
        ServiceDescriptor::native(name, phase, "sleep", &["30"], "http://localhost:11000/healthz")
    }

    #[test]
    fn test_load_orders_by_phase_stably() {
        let store = DescriptorStore::load(vec![
            native("aux-b", Phase::Auxiliary),
            native("core-a", Phase::Core),
            native("aux-a", Phase::Auxiliary),
            native("prereq", Phase::Prereqs),
        ])
        .unwrap();

        let names: Vec<_> = store.list().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["prereq", "core-a", "aux-b", "aux-a"]);
        assert_eq!(store.in_phase(Phase::Auxiliary).count(), 2);
    }

    #[test]
    fn test_duplicate_names_fail_the_whole_load() {
        let err = DescriptorStore::load(vec![native("core-api", Phase::Core), native("core-api", Phase::Auxiliary)])
            .unwrap_err();
        match err {
            WardenError::Load(msg) => assert!(msg.contains("duplicate service name 'core-api'")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_name_and_bad_url_are_reported_together() {
        let mut nameless = native("", Phase::Core);
        nameless.health.url = "not a url".to_string();
        let err = DescriptorStore::load(vec![nameless]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("empty name"));
        assert!(msg.contains("malformed"));
    }

    #[test]
    fn test_native_without_command_is_rejected() {
        let mut svc = native("core-api", Phase::Core);
        svc.command = None;
        assert!(DescriptorStore::load(vec![svc]).is_err());
    }

    #[test]
    fn test_dependency_on_later_phase_is_rejected() {
        let mut core = native("core-api", Phase::Core);
        core.depends_on = vec!["aux-tool".to_string()];
        let err = DescriptorStore::load(vec![core, native("aux-tool", Phase::Auxiliary)]).unwrap_err();
        assert!(err.to_string().contains("later phase"));
    }
}
