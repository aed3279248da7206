//! Versioned, read-mostly store of journey definitions.
//!
//! Versions referenced by live executions stay untouched: every edit goes
//! through `publish_new_version`, so a running execution keeps the graph it
//! started with.

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use waypoint_core::collaborators::CatalogLookup;
use waypoint_core::{EngineError, EngineResult};

use crate::types::{DefinitionStatus, JourneyDefinition, JourneyGraph, TriggerSpec};
use crate::validator::validate;

/// In-memory definition store. Keyed by journey id; versions ascending.
#[derive(Default)]
pub struct DefinitionStore {
    journeys: DashMap<Uuid, Vec<JourneyDefinition>>,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a new journey as version 1 in `Draft`.
    pub fn create(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        trigger_specs: Vec<TriggerSpec>,
        graph: JourneyGraph,
        catalog: &dyn CatalogLookup,
    ) -> EngineResult<JourneyDefinition> {
        check_graph(&graph, catalog)?;

        let now = Utc::now();
        let definition = JourneyDefinition {
            id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            description: description.into(),
            status: DefinitionStatus::Draft,
            trigger_specs,
            graph,
            created_at: now,
            updated_at: now,
        };

        info!(journey_id = %definition.id, name = %definition.name, "Creating journey definition");
        self.journeys.insert(definition.id, vec![definition.clone()]);
        Ok(definition)
    }

    /// Latest version of the journey, if it exists.
    pub fn get(&self, id: Uuid) -> Option<JourneyDefinition> {
        self.journeys.get(&id).and_then(|v| v.last().cloned())
    }

    /// A specific version, as referenced by an execution record.
    pub fn get_version(&self, id: Uuid, version: u32) -> Option<JourneyDefinition> {
        self.journeys
            .get(&id)
            .and_then(|v| v.iter().find(|d| d.version == version).cloned())
    }

    /// Latest version of every journey.
    pub fn list(&self) -> Vec<JourneyDefinition> {
        self.journeys
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .collect()
    }

    /// Latest versions currently in `Active`.
    pub fn active(&self) -> Vec<JourneyDefinition> {
        self.list()
            .into_iter()
            .filter(|d| d.status == DefinitionStatus::Active)
            .collect()
    }

    /// Active journeys with an event trigger matching `event_type`.
    pub fn match_event(&self, event_type: &str) -> Vec<JourneyDefinition> {
        self.active()
            .into_iter()
            .filter(|d| d.matches_event(event_type))
            .collect()
    }

    /// Move the latest version through its lifecycle. Archived is terminal.
    pub fn set_status(&self, id: Uuid, status: DefinitionStatus) -> EngineResult<()> {
        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("journey {}", id)))?;
        let latest = entry
            .last_mut()
            .ok_or_else(|| EngineError::NotFound(format!("journey {}", id)))?;

        if !status_transition_allowed(latest.status, status) {
            return Err(EngineError::InvalidTransition(format!(
                "journey {} cannot move from {:?} to {:?}",
                id, latest.status, status
            )));
        }

        info!(journey_id = %id, ?status, "Updating journey status");
        latest.status = status;
        latest.updated_at = Utc::now();
        Ok(())
    }

    /// Publish an edited graph as a new version. The previous version stays
    /// in the store for executions that reference it; the new version
    /// inherits the current lifecycle status.
    pub fn publish_new_version(
        &self,
        id: Uuid,
        trigger_specs: Vec<TriggerSpec>,
        graph: JourneyGraph,
        catalog: &dyn CatalogLookup,
    ) -> EngineResult<JourneyDefinition> {
        check_graph(&graph, catalog)?;

        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("journey {}", id)))?;
        let latest = entry
            .last()
            .ok_or_else(|| EngineError::NotFound(format!("journey {}", id)))?;

        if latest.status == DefinitionStatus::Archived {
            return Err(EngineError::InvalidTransition(format!(
                "journey {} is archived",
                id
            )));
        }

        let next = JourneyDefinition {
            version: latest.version + 1,
            trigger_specs,
            graph,
            updated_at: Utc::now(),
            ..latest.clone()
        };
        info!(journey_id = %id, version = next.version, "Published new journey version");
        entry.push(next.clone());
        Ok(next)
    }
}

fn status_transition_allowed(from: DefinitionStatus, to: DefinitionStatus) -> bool {
    use DefinitionStatus::*;
    matches!(
        (from, to),
        (Draft, Active) | (Active, Paused) | (Paused, Active) | (Draft, Archived)
            | (Active, Archived)
            | (Paused, Archived)
    )
}

fn check_graph(graph: &JourneyGraph, catalog: &dyn CatalogLookup) -> EngineResult<()> {
    validate(graph, catalog).map_err(|issues| {
        let summary = issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        EngineError::Validation(summary)
    })
}
