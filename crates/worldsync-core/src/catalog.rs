//! Agent templates used to seed a fresh world.
//!
//! When the stored population is missing, empty or undecodable, the
//! authority builds a new one from a [`TemplateCatalog`]. The engine reads
//! the catalog from the `templates` section of `worldsync-config.yaml` and
//! falls back to [`TemplateCatalog::builtin`].

use chrono::{DateTime, Utc};
use serde::Deserialize;
use worldsync_types::{Agent, Capability, Vitals};

/// One kind of agent the world starts with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentTemplate {
    /// Template id copied onto every agent built from it.
    pub id: String,
    /// Display name. Numbered when `count > 1`.
    pub name: String,
    /// Starting location.
    pub location: String,
    /// How many agents to create.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Starting level.
    #[serde(default = "default_level")]
    pub level: u32,
    /// Starting maximum HP.
    #[serde(default = "default_max_hp")]
    pub max_hp: i64,
    /// Starting gold.
    #[serde(default)]
    pub gold: i64,
    /// Capabilities granted.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl AgentTemplate {
    /// Build this template's agents, born at `now`.
    pub fn instantiate(&self, now: DateTime<Utc>) -> Vec<Agent> {
        (1..=self.count)
            .map(|i| {
                let name = if self.count > 1 {
                    format!("{} {i}", self.name)
                } else {
                    self.name.clone()
                };
                let mut agent = Agent::new(name, self.id.clone(), self.location.clone(), now)
                    .with_capabilities(self.capabilities.iter().copied());
                agent.vitals = Vitals {
                    hp: self.max_hp,
                    max_hp: self.max_hp,
                    level: self.level,
                    experience: 0,
                    gold: self.gold,
                };
                agent
            })
            .collect()
    }
}

/// The set of templates a fresh world is built from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TemplateCatalog {
    templates: Vec<AgentTemplate>,
}

impl TemplateCatalog {
    /// Wrap an explicit template list.
    pub const fn new(templates: Vec<AgentTemplate>) -> Self {
        Self { templates }
    }

    /// A small default town.
    pub fn builtin() -> Self {
        let everyone = vec![
            Capability::Ages,
            Capability::Reproduces,
            Capability::Respawns,
            Capability::Imprisonable,
        ];
        Self::new(vec![
            AgentTemplate {
                id: "guard".to_owned(),
                name: "Town Guard".to_owned(),
                location: "Main Street".to_owned(),
                count: 4,
                level: 10,
                max_hp: 220,
                gold: 150,
                capabilities: vec![Capability::Ages, Capability::Respawns],
            },
            AgentTemplate {
                id: "merchant".to_owned(),
                name: "Merchant".to_owned(),
                location: "Market".to_owned(),
                count: 3,
                level: 3,
                max_hp: 80,
                gold: 2_000,
                capabilities: everyone.clone(),
            },
            AgentTemplate {
                id: "villager".to_owned(),
                name: "Villager".to_owned(),
                location: "Town Square".to_owned(),
                count: 8,
                level: 1,
                max_hp: 60,
                gold: 25,
                capabilities: everyone,
            },
        ])
    }

    /// The templates.
    pub fn templates(&self) -> &[AgentTemplate] {
        &self.templates
    }

    /// Build the initial population.
    pub fn bootstrap(&self, now: DateTime<Utc>) -> Vec<Agent> {
        self.templates
            .iter()
            .flat_map(|t| t.instantiate(now))
            .collect()
    }
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

const fn default_count() -> u32 {
    1
}

const fn default_level() -> u32 {
    1
}

const fn default_max_hp() -> i64 {
    100
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_populates_a_town() {
        let agents = TemplateCatalog::builtin().bootstrap(Utc::now());
        assert_eq!(agents.len(), 15);
        assert!(agents.iter().all(Agent::is_alive));
        assert!(agents.iter().any(|a| a.name == "Merchant 2"));
    }

    #[test]
    fn templates_parse_from_yaml_with_defaults() {
        let yaml = r"
- id: hermit
  name: The Hermit
  location: Cave
  capabilities: [Ages]
- id: smith
  name: Smith
  location: Forge
  count: 2
  max_hp: 140
";
        let catalog: TemplateCatalog = serde_yml::from_str(yaml).unwrap();
        let agents = catalog.bootstrap(Utc::now());
        assert_eq!(agents.len(), 3);
        let hermit = agents.first().unwrap();
        assert_eq!(hermit.name, "The Hermit");
        assert_eq!(hermit.vitals.max_hp, 100);
        assert!(hermit.can(Capability::Ages));
        assert_eq!(agents.get(2).unwrap().name, "Smith 2");
    }
}
