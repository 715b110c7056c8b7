//! Component health registry. Each entry has a single writer (the
//! component that owns it); readers take snapshots for reporting.

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Degraded,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Ok => "ok",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
        }
    }
}

#[derive(Default)]
pub struct HealthRegistry {
    components: DashMap<String, HealthState>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, component: &str, state: HealthState) {
        self.components.insert(component.to_string(), state);
    }

    pub fn get(&self, component: &str) -> Option<HealthState> {
        self.components.get(component).map(|entry| *entry.value())
    }

    /// Overall status: down if anything is down, degraded if anything is
    /// degraded, ok otherwise.
    pub fn overall(&self) -> HealthState {
        let mut overall = HealthState::Ok;
        for entry in self.components.iter() {
            match entry.value() {
                HealthState::Down => return HealthState::Down,
                HealthState::Degraded => overall = HealthState::Degraded,
                HealthState::Ok => {}
            }
        }
        overall
    }

    pub fn snapshot(&self) -> Vec<(String, HealthState)> {
        self.components
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
