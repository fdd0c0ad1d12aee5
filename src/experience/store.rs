//! Session and experience persistence on top of the graph store.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::experience::tags::{collect_tags, infer_tags};
use crate::experience::types::*;
use crate::graph::{
    timestamp_now, Edge, EdgeType, GraphStore, GraphTx, GraphView, Node, NodeFilter, NodeId,
    NodeOrder, NodeType,
};

const DEFAULT_PAGE_SIZE: usize = 64;

/// Records sessions and their immutable experiences.
pub struct ExperienceStore {
    graph: Arc<GraphStore>,
    page_size: usize,
}

impl ExperienceStore {
    /// Create a store over an existing graph.
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self {
            graph,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size used by [`ExperienceCursor`].
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    // ==================== Agents & Sessions ====================

    /// Register an agent with a display name. Existing agents are left untouched.
    pub fn register_agent(&self, agent_id: &AgentId, display_name: &str) -> Result<NodeId> {
        self.graph.write(|tx| ensure_agent(tx, agent_id, display_name))
    }

    /// Begin a new session for an agent, creating the agent on first use.
    #[instrument(skip(self, goal), fields(agent_id = %agent_id))]
    pub fn start_session(&self, agent_id: &AgentId, goal: &str) -> Result<Session> {
        self.begin_session(agent_id, goal, false)
    }

    /// Start a session whose goal may already have had credentials redacted.
    pub(crate) fn begin_session(
        &self,
        agent_id: &AgentId,
        goal: &str,
        redacted: bool,
    ) -> Result<Session> {
        if agent_id.as_str().trim().is_empty() {
            return Err(Error::validation("agent_id must not be empty"));
        }

        let session = Session {
            id: SessionId::new(),
            agent_id: agent_id.clone(),
            goal: goal.to_string(),
            start_time: timestamp_now(),
            end_time: None,
            outcome: None,
            success: None,
            metrics: Default::default(),
            contains_redacted_credentials: redacted,
        };

        self.graph.write(|tx| {
            let agent_node = ensure_agent(tx, &session.agent_id, session.agent_id.as_str())?;
            tx.create_node(&session.to_node())?;
            tx.create_edge(&Edge::new(
                EdgeType::ConductedSession,
                agent_node,
                session.id.node_id(),
            ))?;
            Ok(())
        })?;
        info!(session_id = %session.id, "session started");
        Ok(session)
    }

    /// Get a session by ID.
    pub fn get_session(&self, id: &SessionId) -> Result<Session> {
        self.graph.read(|view| load_session(view, id))
    }

    /// List sessions, optionally for a single agent, oldest first.
    pub fn list_sessions(&self, agent_id: Option<&AgentId>) -> Result<Vec<Session>> {
        let mut filter = NodeFilter::of_type(NodeType::Session);
        if let Some(agent) = agent_id {
            filter = filter.attr("agent_id", agent.as_str());
        }
        self.graph.read(|view| {
            view.find_nodes(&filter)?
                .iter()
                .map(Session::from_node)
                .collect()
        })
    }

    /// Close a session with its outcome.
    ///
    /// Fails with `InvalidState` if the session was already finalized; the
    /// first outcome is never overwritten.
    #[instrument(skip(self, outcome), fields(session_id = %id))]
    pub fn finalize_session(&self, id: &SessionId, outcome: SessionOutcome) -> Result<Session> {
        self.finalize_with(id, outcome, false)
    }

    pub(crate) fn finalize_with(
        &self,
        id: &SessionId,
        outcome: SessionOutcome,
        redacted: bool,
    ) -> Result<Session> {
        if outcome.metrics.values().any(|v| !v.is_finite()) {
            return Err(Error::validation("session metrics must be finite numbers"));
        }

        let session = self.graph.write(|tx| {
            let mut session = load_session(&tx.view(), id)?;
            if session.is_finalized() {
                return Err(Error::invalid_state(
                    "session",
                    id,
                    "session is already finalized",
                ));
            }

            session.end_time = Some(timestamp_now().max(session.start_time));
            session.outcome = Some(outcome.outcome);
            session.success = Some(outcome.success);
            session.metrics = outcome.metrics;
            session.contains_redacted_credentials |= redacted;

            tx.update_attributes(&id.node_id(), session.attributes())?;
            Ok(session)
        })?;
        info!(success = ?session.success, "session finalized");
        Ok(session)
    }

    // ==================== Experiences ====================

    /// Record an experience in an open session.
    ///
    /// Caller tags are kept as given and merged with tags inferred from the content.
    #[instrument(skip(self, content, tags), fields(session_id = %session_id))]
    pub fn record_experience<I, S>(
        &self,
        session_id: &SessionId,
        experience_type: ExperienceType,
        content: &str,
        tags: I,
    ) -> Result<Experience>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if content.trim().is_empty() {
            return Err(Error::validation("experience content must not be empty"));
        }

        let mut all_tags = collect_tags(tags);
        all_tags.extend(infer_tags(content));

        let experience = self.graph.write(|tx| {
            let view = tx.view();
            let session = load_session(&view, session_id)?;
            if session.is_finalized() {
                return Err(Error::invalid_state(
                    "session",
                    session_id,
                    "cannot record experiences in a finalized session",
                ));
            }

            let recorded = view.count_nodes(
                &NodeFilter::of_type(NodeType::Experience)
                    .attr("session_id", session_id.to_string()),
            )?;

            let experience = Experience {
                id: ExperienceId::new(),
                session_id: session_id.clone(),
                experience_type,
                content: content.to_string(),
                tags: all_tags,
                created_at: timestamp_now(),
                sequence: recorded + 1,
            };
            tx.create_node(&experience.to_node())?;
            tx.create_edge(&Edge::new(
                EdgeType::Recorded,
                session_id.node_id(),
                experience.id.node_id(),
            ))?;
            Ok(experience)
        })?;

        debug!(experience_id = %experience.id, sequence = experience.sequence, "experience recorded");
        Ok(experience)
    }

    /// Get an experience by ID.
    pub fn get_experience(&self, id: &ExperienceId) -> Result<Experience> {
        self.graph.read(|view| {
            let node = view.require_node(&id.node_id(), NodeType::Experience)?;
            Experience::from_node(&node)
        })
    }

    /// Lazily iterate a session's experiences in creation order.
    pub fn get_session_experiences(&self, session_id: &SessionId) -> Result<ExperienceCursor<'_>> {
        self.get_session(session_id)?;
        Ok(ExperienceCursor::new(self, session_id.clone()))
    }

    fn fetch_page(&self, session_id: &SessionId, after: u64) -> Result<Vec<Experience>> {
        let filter = NodeFilter::of_type(NodeType::Experience)
            .attr("session_id", session_id.to_string())
            .attr_greater_than("sequence", after as i64)
            .order(NodeOrder::AttrAsc("sequence"))
            .limit(self.page_size);
        self.graph.read(|view| {
            view.find_nodes(&filter)?
                .iter()
                .map(Experience::from_node)
                .collect()
        })
    }

    // ==================== Aggregates ====================

    /// Session and experience counts, optionally restricted to some sessions.
    pub fn counts(&self, sessions: Option<&BTreeSet<SessionId>>) -> Result<ExperienceCounts> {
        self.graph.read(|view| {
            let all = view
                .find_nodes(&NodeFilter::of_type(NodeType::Session))?
                .iter()
                .map(Session::from_node)
                .collect::<Result<Vec<_>>>()?;

            let mut counts = ExperienceCounts::default();
            for session in all
                .iter()
                .filter(|s| sessions.map(|set| set.contains(&s.id)).unwrap_or(true))
            {
                counts.sessions += 1;
                if session.is_finalized() {
                    counts.finalized_sessions += 1;
                }
                counts.experiences += view.count_nodes(
                    &NodeFilter::of_type(NodeType::Experience)
                        .attr("session_id", session.id.to_string()),
                )?;
            }
            Ok(counts)
        })
    }
}

/// Aggregate counts over sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExperienceCounts {
    pub sessions: u64,
    pub finalized_sessions: u64,
    pub experiences: u64,
}

pub(crate) fn load_session(view: &GraphView<'_>, id: &SessionId) -> Result<Session> {
    let node = view.require_node(&id.node_id(), NodeType::Session)?;
    Session::from_node(&node)
}

fn ensure_agent(tx: &GraphTx<'_>, agent_id: &AgentId, display_name: &str) -> Result<NodeId> {
    let existing = tx.view().find_nodes(
        &NodeFilter::of_type(NodeType::Agent)
            .attr("agent_id", agent_id.as_str())
            .limit(1),
    )?;
    if let Some(node) = existing.into_iter().next() {
        return Ok(node.id);
    }

    let node = Node::new(NodeType::Agent)
        .with_attr("agent_id", agent_id.as_str())
        .with_attr("display_name", display_name)
        .with_attr("registered_at", json!(timestamp_now()));
    info!(agent_id = %agent_id, "agent registered");
    tx.create_node(&node)
}

/// Lazy, restartable, finite iterator over a session's experiences.
///
/// Experiences are fetched in pages ordered by sequence number; each page is
/// read from a fresh snapshot.
pub struct ExperienceCursor<'a> {
    store: &'a ExperienceStore,
    session_id: SessionId,
    last_sequence: u64,
    buffer: VecDeque<Experience>,
    exhausted: bool,
}

impl<'a> ExperienceCursor<'a> {
    fn new(store: &'a ExperienceStore, session_id: SessionId) -> Self {
        Self {
            store,
            session_id,
            last_sequence: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Restart from the first experience.
    pub fn rewind(&mut self) {
        self.last_sequence = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Iterator for ExperienceCursor<'_> {
    type Item = Result<Experience>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.fetch_page(&self.session_id, self.last_sequence) {
                Ok(page) => {
                    if page.len() < self.store.page_size {
                        self.exhausted = true;
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let experience = self.buffer.pop_front()?;
        self.last_sequence = experience.sequence;
        Some(Ok(experience))
    }
}
