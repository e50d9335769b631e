//! The memory engine façade.
//!
//! Owns ingestion (event → units + resolves + evolves edges), working
//! snapshot publication, crystal compilation and cross-session
//! promotion/decay, and hybrid retrieval with the optional cognitive
//! reranker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::json;

use ov_domain::config::{MemoryConfig, RerankMode, RetrievalWeights};
use ov_domain::error::Result;
use ov_events::{EventRecord, EventStore};

use crate::evolves::{infer_relation, EdgeStatus, EvolvesEdge, Relation};
use crate::extract::{extract, merge_candidates, ResolveDirective};
use crate::insight::{Insight, InsightStatus};
use crate::retrieval::{
    hybrid_score, normalize_weights, CognitiveRanker, RankCandidate, RankOutcome,
};
use crate::store::{Crystal, MemoryStore};
use crate::unit::{fingerprint, normalize, MemoryUnit, UnitStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    /// Caller override; normalized to sum 1 before scoring.
    pub weights: Option<RetrievalWeights>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub unit: MemoryUnit,
    pub score: f64,
}

/// An externally retrieved memory item handed back into the tier.
#[derive(Debug, Clone)]
pub struct RecallItem {
    pub topic: String,
    pub statement: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildMode {
    /// Clear the session's units, then ingest the tape.
    Replace,
    /// Ingest the tape on top of the existing units.
    Merge,
}

#[derive(Default)]
struct EngineState {
    dirty_topics: HashMap<String, HashSet<String>>,
    working_cache: HashMap<String, String>,
    last_publish_day: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryEngine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryEngine {
    config: MemoryConfig,
    store: Arc<MemoryStore>,
    events: Arc<EventStore>,
    ranker: Option<Arc<dyn CognitiveRanker>>,
    state: Mutex<EngineState>,
    /// Serializes snapshot publication; losers reuse the cached snapshot.
    refresh_lock: Mutex<()>,
}

impl MemoryEngine {
    pub fn new(
        config: MemoryConfig,
        store: Arc<MemoryStore>,
        events: Arc<EventStore>,
        ranker: Option<Arc<dyn CognitiveRanker>>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            ranker,
            state: Mutex::new(EngineState::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    // ── Ingestion ────────────────────────────────────────────────────

    /// Extract units from one event and fold them into the session's
    /// memory. Returns the number of units touched.
    pub fn ingest_event(&self, event: &EventRecord) -> Result<usize> {
        let extraction = extract(event);
        let session_id = event.session_id.clone();
        let mut touched = 0usize;

        for directive in &extraction.resolves {
            touched += self.apply_resolve(&session_id, directive)?;
        }

        for candidate in merge_candidates(extraction.candidates) {
            let fp = fingerprint(candidate.kind, &candidate.topic, &candidate.statement);
            let now = Utc::now();

            let unit = match self.store.active_by_fingerprint(&session_id, &fp) {
                Some(mut existing) => {
                    existing.confidence = existing.confidence.max(candidate.confidence);
                    for source_ref in &candidate.source_refs {
                        if !existing.source_refs.contains(source_ref) {
                            existing.source_refs.push(source_ref.clone());
                        }
                    }
                    existing.last_seen_at = now;
                    existing.updated_at = now;
                    self.store.put_unit(&existing)?;
                    existing
                }
                None => {
                    let unit = MemoryUnit {
                        id: uuid::Uuid::new_v4().to_string(),
                        session_id: session_id.clone(),
                        kind: candidate.kind,
                        status: UnitStatus::Active,
                        topic: candidate.topic.clone(),
                        statement: candidate.statement.clone(),
                        fingerprint: fp,
                        confidence: candidate.confidence,
                        source_refs: candidate.source_refs.clone(),
                        metadata: None,
                        updated_at: now,
                        last_seen_at: now,
                    };
                    self.store.put_unit(&unit)?;
                    self.infer_edges(&unit)?;
                    unit
                }
            };

            self.mark_dirty(&session_id, &unit.topic);
            touched += 1;
        }

        Ok(touched)
    }

    fn apply_resolve(&self, session_id: &str, directive: &ResolveDirective) -> Result<usize> {
        let topic_norm = normalize(&directive.topic);
        let statement_norm = directive.statement.as_deref().map(normalize);
        let mut resolved = 0usize;

        for mut unit in self.store.active_session_units(session_id) {
            let unit_topic = normalize(&unit.topic);
            let topic_matches = if directive.prefix {
                unit_topic.starts_with(&topic_norm)
            } else {
                unit_topic == topic_norm
            };
            if !topic_matches {
                continue;
            }
            if let Some(stmt) = &statement_norm {
                if &normalize(&unit.statement) != stmt {
                    continue;
                }
            }
            unit.status = UnitStatus::Resolved;
            unit.updated_at = Utc::now();
            self.store.put_unit(&unit)?;
            self.mark_dirty(session_id, &unit.topic);
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Propose evolves edges from a new unit toward existing active units
    /// of the same topic. At most one edge per `(source, target)`; a
    /// reverse edge suppresses the proposal (no cycles).
    fn infer_edges(&self, unit: &MemoryUnit) -> Result<()> {
        let peers: Vec<MemoryUnit> = self
            .store
            .active_session_units(&unit.session_id)
            .into_iter()
            .filter(|p| p.id != unit.id && normalize(&p.topic) == normalize(&unit.topic))
            .collect();

        for peer in peers {
            if self.store.edge_between(&unit.id, &peer.id).is_some()
                || self.store.edge_between(&peer.id, &unit.id).is_some()
            {
                continue;
            }
            let Some((relation, confidence)) = infer_relation(&unit.statement, &peer.statement)
            else {
                continue;
            };
            let edge = EvolvesEdge {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: unit.session_id.clone(),
                source_unit_id: unit.id.clone(),
                target_unit_id: peer.id.clone(),
                relation,
                status: EdgeStatus::Proposed,
                confidence,
                rationale: None,
                updated_at: Utc::now(),
            };
            self.store.put_edge(&edge)?;

            if relation == Relation::Challenges {
                let insight = Insight {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: unit.session_id.clone(),
                    kind: "conflict".into(),
                    message: format!(
                        "\"{}\" challenges \"{}\" on topic {}",
                        unit.statement, peer.statement, unit.topic
                    ),
                    unit_ids: vec![unit.id.clone(), peer.id.clone()],
                    edge_id: Some(edge.id.clone()),
                    status: InsightStatus::Active,
                    updated_at: Utc::now(),
                };
                self.store.put_insight(&insight)?;
            }
        }
        Ok(())
    }

    // ── Working snapshot ─────────────────────────────────────────────

    /// Re-publish the working snapshot when topics are dirty or the daily
    /// refresh hour has been crossed. Returns true when this call did the
    /// publish; a concurrent loser reuses the cached snapshot.
    pub fn refresh_if_needed(&self, session_id: &str) -> Result<bool> {
        self.refresh_at(session_id, Utc::now())
    }

    pub fn refresh_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let day_key = format!("{:04}-{:02}-{:02}", now.year(), now.month(), now.day());
        let needs = {
            let state = self.state.lock();
            let dirty = state
                .dirty_topics
                .get(session_id)
                .is_some_and(|topics| !topics.is_empty());
            let day_stale = now.hour() >= self.config.refresh_hour
                && state.last_publish_day.as_deref() != Some(day_key.as_str());
            dirty || day_stale || !state.working_cache.contains_key(session_id)
        };
        if !needs {
            return Ok(false);
        }

        let Some(_guard) = self.refresh_lock.try_lock() else {
            return Ok(false);
        };

        self.compile_crystals(session_id)?;
        let rendered = self.render_working(session_id);
        {
            let mut state = self.state.lock();
            state
                .working_cache
                .insert(session_id.to_string(), rendered);
            state.dirty_topics.remove(session_id);
            if now.hour() >= self.config.refresh_hour {
                state.last_publish_day = Some(day_key);
            }
        }
        let full: String = {
            let state = self.state.lock();
            let mut sections: Vec<(&String, &String)> = state.working_cache.iter().collect();
            sections.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = String::from("# Working Memory\n");
            for (_, section) in sections {
                out.push('\n');
                out.push_str(section);
            }
            out
        };
        self.store.write_working_md(&full)?;
        Ok(true)
    }

    pub fn get_working_memory(&self, session_id: &str) -> String {
        if let Some(cached) = self.state.lock().working_cache.get(session_id) {
            return cached.clone();
        }
        let rendered = self.render_working(session_id);
        self.state
            .lock()
            .working_cache
            .insert(session_id.to_string(), rendered.clone());
        rendered
    }

    fn render_working(&self, session_id: &str) -> String {
        let units = self.store.active_session_units(session_id);
        let mut by_topic: HashMap<String, Vec<&MemoryUnit>> = HashMap::new();
        for unit in &units {
            by_topic.entry(unit.topic.clone()).or_default().push(unit);
        }
        let mut topics: Vec<String> = by_topic.keys().cloned().collect();
        topics.sort();

        let mut out = format!("## {session_id}\n");
        for topic in topics {
            out.push_str(&format!("\n### {topic}\n"));
            let mut topic_units = by_topic.remove(&topic).unwrap_or_default();
            topic_units.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for unit in topic_units {
                out.push_str(&format!(
                    "- [{}] {} ({:.2})\n",
                    unit.kind.as_str(),
                    unit.statement,
                    unit.confidence
                ));
            }
        }
        for crystal in self.store.scope_crystals(session_id) {
            out.push_str(&format!("\n### crystal: {}\n{}\n", crystal.topic, crystal.summary));
        }
        out
    }

    fn mark_dirty(&self, session_id: &str, topic: &str) {
        self.state
            .lock()
            .dirty_topics
            .entry(session_id.to_string())
            .or_default()
            .insert(normalize(topic));
    }

    // ── Crystals, promotion, decay ───────────────────────────────────

    /// Compile a crystal draft for every topic holding at least
    /// `crystal_min_units` active units.
    pub fn compile_crystals(&self, session_id: &str) -> Result<Vec<Crystal>> {
        let units = self.store.active_session_units(session_id);
        let mut by_topic: HashMap<String, Vec<MemoryUnit>> = HashMap::new();
        for unit in units {
            by_topic.entry(normalize(&unit.topic)).or_default().push(unit);
        }

        let mut compiled = Vec::new();
        for (topic_norm, mut topic_units) in by_topic {
            if topic_units.len() < self.config.crystal_min_units {
                continue;
            }
            let now = Utc::now();
            // Rank by confidence + recency, take the top N.
            topic_units.sort_by(|a, b| {
                let score = |u: &MemoryUnit| {
                    u.confidence + crate::retrieval::recency_score(u, now)
                };
                score(b)
                    .partial_cmp(&score(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            topic_units.truncate(self.config.crystal_top_n);

            let topic = topic_units[0].topic.clone();
            let summary = topic_units
                .iter()
                .map(|u| format!("- {}", u.statement))
                .collect::<Vec<_>>()
                .join("\n");
            let crystal = Crystal {
                id: format!("crystal-{session_id}-{topic_norm}").replace(' ', "-"),
                scope: session_id.to_string(),
                topic,
                summary,
                unit_ids: topic_units.iter().map(|u| u.id.clone()).collect(),
                updated_at: now,
            };
            self.store.put_crystal(&crystal)?;
            compiled.push(crystal);
        }
        Ok(compiled)
    }

    /// Promote units recurring across sessions into the global tier.
    pub fn promote_global_units(&self) -> Result<usize> {
        let mut by_fingerprint: HashMap<String, (HashSet<String>, MemoryUnit)> = HashMap::new();
        for unit in self.store.all_units() {
            if unit.status != UnitStatus::Active {
                continue;
            }
            let entry = by_fingerprint
                .entry(unit.fingerprint.clone())
                .or_insert_with(|| (HashSet::new(), unit.clone()));
            entry.0.insert(unit.session_id.clone());
            if unit.confidence > entry.1.confidence {
                entry.1 = unit;
            }
        }

        let existing: HashSet<String> = self
            .store
            .global_units()
            .iter()
            .map(|u| u.fingerprint.clone())
            .collect();

        let mut promoted = 0usize;
        for (fp, (sessions, best)) in by_fingerprint {
            if sessions.len() < self.config.promotion_session_floor
                || best.confidence < self.config.promotion_confidence_floor
                || existing.contains(&fp)
            {
                continue;
            }
            let global = MemoryUnit {
                id: format!("g-{fp}"),
                session_id: "global".into(),
                ..best
            };
            self.store.put_global_unit(&global)?;
            promoted += 1;
        }

        if promoted > 0 {
            self.store.write_global_sync_snapshot(Utc::now())?;
        }
        Ok(promoted)
    }

    /// Exponential decay of global units every `decay_interval_days`,
    /// pruning those that sink below the confidence floor.
    pub fn run_decay_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut meta = self.store.global_meta();
        let Some(last) = meta.last_decay_at else {
            meta.last_decay_at = Some(now);
            self.store.put_global_meta(&meta)?;
            return Ok(0);
        };

        let interval = self.config.decay_interval_days.max(1);
        let periods = now.signed_duration_since(last).num_days() / interval;
        if periods < 1 {
            return Ok(0);
        }

        let factor = self.config.decay_factor.powi(periods as i32);
        let mut pruned = 0usize;
        let survivors: Vec<MemoryUnit> = self
            .store
            .global_units()
            .into_iter()
            .filter_map(|mut unit| {
                unit.confidence *= factor;
                if unit.confidence < self.config.prune_below_confidence {
                    pruned += 1;
                    None
                } else {
                    Some(unit)
                }
            })
            .collect();
        self.store.replace_global_units(survivors)?;

        meta.last_decay_at = Some(last + chrono::Duration::days(periods * interval));
        self.store.put_global_meta(&meta)?;
        Ok(pruned)
    }

    // ── Retrieval ────────────────────────────────────────────────────

    /// Synchronous hybrid search. A configured asynchronous ranker is
    /// skipped with an explicit event rather than blocked on.
    pub fn search(&self, session_id: &str, request: &SearchRequest) -> Vec<SearchHit> {
        let mut hits = self.hybrid_hits(session_id, request);
        let mode = self.config.rerank_mode;
        if mode == RerankMode::Off || hits.is_empty() {
            return hits;
        }
        let Some(ranker) = &self.ranker else {
            return hits;
        };

        let k = self.config.max_rank_candidates_per_search.min(hits.len());
        let candidates: Vec<RankCandidate> = hits[..k]
            .iter()
            .map(|h| RankCandidate {
                unit_id: h.unit.id.clone(),
                topic: h.unit.topic.clone(),
                statement: h.unit.statement.clone(),
            })
            .collect();

        match ranker.try_rank(&request.query, &candidates) {
            RankOutcome::Ready(order) => {
                self.apply_rerank(session_id, &mut hits, k, &order, mode);
            }
            RankOutcome::Pending => {
                self.emit_rerank_event(
                    session_id,
                    "memory_rerank_skipped",
                    &json!({ "reason": "async_result_not_applicable_to_sync_search" }),
                );
            }
        }
        hits
    }

    /// Asynchronous search: awaits the ranker when it is asynchronous.
    pub async fn search_async(&self, session_id: &str, request: &SearchRequest) -> Vec<SearchHit> {
        let mut hits = self.hybrid_hits(session_id, request);
        let mode = self.config.rerank_mode;
        if mode == RerankMode::Off || hits.is_empty() {
            return hits;
        }
        let Some(ranker) = &self.ranker else {
            return hits;
        };

        let k = self.config.max_rank_candidates_per_search.min(hits.len());
        let candidates: Vec<RankCandidate> = hits[..k]
            .iter()
            .map(|h| RankCandidate {
                unit_id: h.unit.id.clone(),
                topic: h.unit.topic.clone(),
                statement: h.unit.statement.clone(),
            })
            .collect();

        let order = ranker.rank(&request.query, &candidates).await;
        if !order.is_empty() {
            self.apply_rerank(session_id, &mut hits, k, &order, mode);
        }
        hits
    }

    fn hybrid_hits(&self, session_id: &str, request: &SearchRequest) -> Vec<SearchHit> {
        let weights = normalize_weights(
            request
                .weights
                .as_ref()
                .unwrap_or(&self.config.retrieval),
        );
        let now = Utc::now();
        let mut pool = self.store.active_session_units(session_id);
        pool.extend(self.store.global_units());

        let mut hits: Vec<SearchHit> = pool
            .into_iter()
            .map(|unit| {
                let score = hybrid_score(&request.query, &unit, &weights, now);
                SearchHit { unit, score }
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.unit.id.cmp(&b.unit.id))
        });
        hits.truncate(request.limit.max(1));
        hits
    }

    /// Reorder the top-K segment by the ranker's preference. Shadow mode
    /// records the proposal without applying it.
    fn apply_rerank(
        &self,
        session_id: &str,
        hits: &mut [SearchHit],
        k: usize,
        order: &[String],
        mode: RerankMode,
    ) {
        let applied = mode == RerankMode::Active;
        self.emit_rerank_event(
            session_id,
            "memory_rerank_recorded",
            &json!({ "applied": applied, "order": order }),
        );
        if !applied {
            return;
        }

        let mut segment: Vec<SearchHit> = hits[..k].to_vec();
        segment.sort_by_key(|h| {
            order
                .iter()
                .position(|id| id == &h.unit.id)
                .unwrap_or(usize::MAX)
        });
        hits[..k].clone_from_slice(&segment);
    }

    fn emit_rerank_event(&self, session_id: &str, kind: &str, payload: &serde_json::Value) {
        if let Err(e) = self
            .events
            .append(session_id, kind, None, Some(payload.clone()))
        {
            tracing::warn!(error = %e, kind, "failed to persist rerank event");
        }
    }

    // ── Recall block & external recall ───────────────────────────────

    /// Render the `[MemoryRecall]` block body for a prompt.
    pub fn build_recall_block(&self, session_id: &str, query: &str, limit: usize) -> Option<String> {
        let hits = self.search(
            session_id,
            &SearchRequest {
                query: query.to_string(),
                limit,
                weights: None,
            },
        );
        if hits.is_empty() {
            return None;
        }
        Some(
            hits.iter()
                .map(|h| format!("- ({}) {}", h.unit.topic, h.unit.statement))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Fold externally retrieved recall items into the session tier.
    pub fn ingest_external_recall(&self, session_id: &str, items: &[RecallItem]) -> Result<usize> {
        let mut ingested = 0usize;
        for item in items {
            let fp = fingerprint(crate::unit::UnitKind::Fact, &item.topic, &item.statement);
            let now = Utc::now();
            match self.store.active_by_fingerprint(session_id, &fp) {
                Some(mut existing) => {
                    existing.confidence = existing.confidence.max(item.confidence);
                    existing.last_seen_at = now;
                    self.store.put_unit(&existing)?;
                }
                None => {
                    self.store.put_unit(&MemoryUnit {
                        id: uuid::Uuid::new_v4().to_string(),
                        session_id: session_id.to_string(),
                        kind: crate::unit::UnitKind::Fact,
                        status: UnitStatus::Active,
                        topic: item.topic.clone(),
                        statement: item.statement.clone(),
                        fingerprint: fp,
                        confidence: item.confidence.clamp(0.0, 1.0),
                        source_refs: vec!["external_recall".into()],
                        metadata: None,
                        updated_at: now,
                        last_seen_at: now,
                    })?;
                }
            }
            self.mark_dirty(session_id, &item.topic);
            ingested += 1;
        }
        Ok(ingested)
    }

    // ── Insights & edges ─────────────────────────────────────────────

    pub fn dismiss_insight(&self, insight_id: &str) -> Result<bool> {
        let Some(mut insight) = self.store.insight(insight_id) else {
            return Ok(false);
        };
        insight.status = InsightStatus::Dismissed;
        insight.updated_at = Utc::now();
        self.store.put_insight(&insight)?;
        Ok(true)
    }

    /// Accept or reject a proposed edge. Accepted `replaces`/`challenges`
    /// edges supersede their target and dismiss related conflict insights.
    pub fn review_evolves_edge(
        &self,
        edge_id: &str,
        accept: bool,
        rationale: Option<String>,
    ) -> Result<Option<EvolvesEdge>> {
        let Some(mut edge) = self.store.edge(edge_id) else {
            return Ok(None);
        };
        edge.status = if accept {
            EdgeStatus::Accepted
        } else {
            EdgeStatus::Rejected
        };
        edge.rationale = rationale;
        edge.updated_at = Utc::now();
        self.store.put_edge(&edge)?;

        if accept && matches!(edge.relation, Relation::Replaces | Relation::Challenges) {
            if let Some(mut target) = self.store.unit(&edge.target_unit_id) {
                target.status = UnitStatus::Superseded;
                target.updated_at = Utc::now();
                self.store.put_unit(&target)?;
                self.mark_dirty(&edge.session_id, &target.topic);
            }
            for mut insight in self.store.session_insights(&edge.session_id) {
                let related = insight.edge_id.as_deref() == Some(edge_id)
                    || insight.unit_ids.contains(&edge.target_unit_id);
                if insight.kind == "conflict"
                    && insight.status == InsightStatus::Active
                    && related
                {
                    insight.status = InsightStatus::Dismissed;
                    insight.updated_at = Utc::now();
                    self.store.put_insight(&insight)?;
                }
            }
        }
        Ok(Some(edge))
    }

    // ── Tape rebuild ─────────────────────────────────────────────────

    /// Rebuild a session's memory from its event tape.
    pub fn rebuild_session_from_tape(
        &self,
        session_id: &str,
        events: &[EventRecord],
        mode: RebuildMode,
    ) -> Result<usize> {
        if mode == RebuildMode::Replace {
            self.store.clear_session_units(session_id)?;
            let mut state = self.state.lock();
            state.dirty_topics.remove(session_id);
            state.working_cache.remove(session_id);
        }
        let mut touched = 0usize;
        for event in events {
            if event.session_id == session_id {
                touched += self.ingest_event(event)?;
            }
        }
        Ok(touched)
    }

    /// Session shutdown: drop caches, keep the store.
    pub fn forget_session(&self, session_id: &str) {
        let mut state = self.state.lock();
        state.dirty_topics.remove(session_id);
        state.working_cache.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitKind;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        events: Arc<EventStore>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStore::open(&dir.path().join("events")).unwrap());
        let store = Arc::new(MemoryStore::open(&dir.path().join("memory")).unwrap());
        Fixture {
            _dir: dir,
            events,
            store,
        }
    }

    fn engine(f: &Fixture, config: MemoryConfig, ranker: Option<Arc<dyn CognitiveRanker>>) -> MemoryEngine {
        MemoryEngine::new(config, f.store.clone(), f.events.clone(), ranker)
    }

    fn truth_event(f: &Fixture, session: &str, topic: &str, statement: &str) -> EventRecord {
        f.events
            .append(
                session,
                "truth_fact_recorded",
                Some(1),
                Some(json!({"topic": topic, "statement": statement})),
            )
            .unwrap()
    }

    #[test]
    fn ingest_creates_one_active_unit_per_fingerprint() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);

        let ev1 = truth_event(&f, "s1", "build", "uses cargo");
        let ev2 = truth_event(&f, "s1", "Build", "Uses Cargo!");
        e.ingest_event(&ev1).unwrap();
        e.ingest_event(&ev2).unwrap();

        let units = f.store.active_session_units("s1");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].source_refs.len(), 2);
    }

    #[test]
    fn resolve_directive_retires_units() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        e.ingest_event(&truth_event(&f, "s1", "build", "uses cargo")).unwrap();

        let resolve = f
            .events
            .append(
                "s1",
                "truth_fact_resolved",
                Some(2),
                Some(json!({"topic": "build"})),
            )
            .unwrap();
        e.ingest_event(&resolve).unwrap();
        assert!(f.store.active_session_units("s1").is_empty());
        assert_eq!(f.store.session_units("s1").len(), 1);
    }

    #[test]
    fn challenge_creates_edge_and_conflict_insight() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        e.ingest_event(&truth_event(&f, "s1", "tests", "tests pass on all platforms"))
            .unwrap();
        e.ingest_event(&truth_event(
            &f,
            "s1",
            "tests",
            "however the tests fail on linux",
        ))
        .unwrap();

        let edges = f.store.session_edges("s1");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, Relation::Challenges);
        assert_eq!(edges[0].status, EdgeStatus::Proposed);

        let insights = f.store.session_insights("s1");
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].kind, "conflict");
    }

    #[test]
    fn accepted_challenge_supersedes_target_and_dismisses_insight() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        e.ingest_event(&truth_event(&f, "s1", "tests", "tests pass on all platforms"))
            .unwrap();
        e.ingest_event(&truth_event(
            &f,
            "s1",
            "tests",
            "however the tests fail on linux",
        ))
        .unwrap();

        let edge = f.store.session_edges("s1")[0].clone();
        let reviewed = e
            .review_evolves_edge(&edge.id, true, Some("verified on ci".into()))
            .unwrap()
            .unwrap();
        assert_eq!(reviewed.status, EdgeStatus::Accepted);

        let target = f.store.unit(&edge.target_unit_id).unwrap();
        assert_eq!(target.status, UnitStatus::Superseded);

        let insights = f.store.session_insights("s1");
        assert_eq!(insights[0].status, InsightStatus::Dismissed);
    }

    #[test]
    fn edge_created_once_per_pair() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        e.ingest_event(&truth_event(&f, "s1", "build", "the build uses cargo")).unwrap();
        e.ingest_event(&truth_event(
            &f,
            "s1",
            "build",
            "the build uses cargo with release profile",
        ))
        .unwrap();
        // Re-seeing the enriching fact must not create a second edge.
        e.ingest_event(&truth_event(
            &f,
            "s1",
            "build",
            "the build uses cargo with release profile",
        ))
        .unwrap();
        assert_eq!(f.store.session_edges("s1").len(), 1);
    }

    #[test]
    fn search_ranks_lexically_relevant_first() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        e.ingest_event(&truth_event(&f, "s1", "build", "the build uses cargo")).unwrap();
        e.ingest_event(&truth_event(&f, "s1", "deploy", "deploys go through staging")).unwrap();

        let hits = e.search(
            "s1",
            &SearchRequest {
                query: "cargo build".into(),
                limit: 5,
                weights: None,
            },
        );
        assert!(!hits.is_empty());
        assert_eq!(hits[0].unit.topic, "build");
    }

    struct SyncRanker;
    #[async_trait::async_trait]
    impl CognitiveRanker for SyncRanker {
        fn try_rank(&self, _query: &str, candidates: &[RankCandidate]) -> RankOutcome {
            // Reverse order.
            RankOutcome::Ready(candidates.iter().rev().map(|c| c.unit_id.clone()).collect())
        }
    }

    struct AsyncOnlyRanker;
    #[async_trait::async_trait]
    impl CognitiveRanker for AsyncOnlyRanker {
        fn try_rank(&self, _query: &str, _candidates: &[RankCandidate]) -> RankOutcome {
            RankOutcome::Pending
        }
        async fn rank(&self, _query: &str, candidates: &[RankCandidate]) -> Vec<String> {
            candidates.iter().rev().map(|c| c.unit_id.clone()).collect()
        }
    }

    fn two_unit_session(f: &Fixture, e: &MemoryEngine) {
        e.ingest_event(&truth_event(f, "s1", "build", "cargo build is fast")).unwrap();
        e.ingest_event(&truth_event(f, "s1", "build2", "cargo test is slow")).unwrap();
    }

    #[test]
    fn active_sync_rerank_is_applied() {
        let f = fixture();
        let e = engine(
            &f,
            MemoryConfig {
                rerank_mode: RerankMode::Active,
                ..Default::default()
            },
            Some(Arc::new(SyncRanker)),
        );
        two_unit_session(&f, &e);

        let plain_engine = engine(&f, MemoryConfig::default(), None);
        let plain = plain_engine.search(
            "s1",
            &SearchRequest {
                query: "cargo".into(),
                limit: 5,
                weights: None,
            },
        );
        let reranked = e.search(
            "s1",
            &SearchRequest {
                query: "cargo".into(),
                limit: 5,
                weights: None,
            },
        );
        assert_eq!(plain.len(), 2);
        assert_eq!(reranked.len(), 2);
        assert_eq!(plain[0].unit.id, reranked[1].unit.id);
    }

    #[test]
    fn shadow_rerank_records_but_keeps_order() {
        let f = fixture();
        let e = engine(
            &f,
            MemoryConfig {
                rerank_mode: RerankMode::Shadow,
                ..Default::default()
            },
            Some(Arc::new(SyncRanker)),
        );
        two_unit_session(&f, &e);

        let hits = e.search(
            "s1",
            &SearchRequest {
                query: "cargo".into(),
                limit: 5,
                weights: None,
            },
        );
        assert_eq!(hits.len(), 2);

        let recorded = f.events.query(
            "s1",
            &ov_events::EventQuery {
                kind: Some("memory_rerank_recorded".into()),
                last: None,
            },
        );
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload.as_ref().unwrap()["applied"], false);
    }

    #[test]
    fn sync_search_skips_async_ranker_with_event() {
        let f = fixture();
        let e = engine(
            &f,
            MemoryConfig {
                rerank_mode: RerankMode::Active,
                ..Default::default()
            },
            Some(Arc::new(AsyncOnlyRanker)),
        );
        two_unit_session(&f, &e);

        e.search(
            "s1",
            &SearchRequest {
                query: "cargo".into(),
                limit: 5,
                weights: None,
            },
        );
        let skipped = f.events.query(
            "s1",
            &ov_events::EventQuery {
                kind: Some("memory_rerank_skipped".into()),
                last: None,
            },
        );
        assert_eq!(skipped.len(), 1);
        assert_eq!(
            skipped[0].payload.as_ref().unwrap()["reason"],
            "async_result_not_applicable_to_sync_search"
        );
    }

    #[tokio::test]
    async fn async_search_applies_async_ranker() {
        let f = fixture();
        let e = engine(
            &f,
            MemoryConfig {
                rerank_mode: RerankMode::Active,
                ..Default::default()
            },
            Some(Arc::new(AsyncOnlyRanker)),
        );
        two_unit_session(&f, &e);

        let sync_hits = e.hybrid_hits(
            "s1",
            &SearchRequest {
                query: "cargo".into(),
                limit: 5,
                weights: None,
            },
        );
        let async_hits = e
            .search_async(
                "s1",
                &SearchRequest {
                    query: "cargo".into(),
                    limit: 5,
                    weights: None,
                },
            )
            .await;
        assert_eq!(sync_hits[0].unit.id, async_hits[1].unit.id);
    }

    #[test]
    fn crystal_compiles_at_threshold() {
        let f = fixture();
        let e = engine(
            &f,
            MemoryConfig {
                crystal_min_units: 3,
                ..Default::default()
            },
            None,
        );
        for i in 0..3 {
            e.ingest_event(&truth_event(
                &f,
                "s1",
                "build",
                &format!("build detail number {i}"),
            ))
            .unwrap();
        }
        let crystals = e.compile_crystals("s1").unwrap();
        assert_eq!(crystals.len(), 1);
        assert_eq!(crystals[0].unit_ids.len(), 3);
        assert!(crystals[0].summary.contains("build detail"));
    }

    #[test]
    fn promotion_requires_recurrence_and_confidence() {
        let f = fixture();
        let e = engine(
            &f,
            MemoryConfig {
                promotion_session_floor: 2,
                promotion_confidence_floor: 0.6,
                ..Default::default()
            },
            None,
        );
        // Same fact in two sessions (confidence 0.7) → promoted.
        e.ingest_event(&truth_event(&f, "s1", "build", "uses cargo")).unwrap();
        e.ingest_event(&truth_event(&f, "s2", "build", "uses cargo")).unwrap();
        // Session-local fact → not promoted.
        e.ingest_event(&truth_event(&f, "s1", "local", "only here")).unwrap();

        let promoted = e.promote_global_units().unwrap();
        assert_eq!(promoted, 1);
        let globals = f.store.global_units();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].session_id, "global");

        // Idempotent.
        assert_eq!(e.promote_global_units().unwrap(), 0);
    }

    #[test]
    fn decay_prunes_low_confidence_globals() {
        let f = fixture();
        let e = engine(
            &f,
            MemoryConfig {
                decay_interval_days: 7,
                decay_factor: 0.5,
                prune_below_confidence: 0.3,
                ..Default::default()
            },
            None,
        );
        let now = Utc::now();
        // First call just stamps the clock.
        assert_eq!(e.run_decay_at(now - chrono::Duration::days(14)).unwrap(), 0);

        f.store
            .put_global_unit(&MemoryUnit {
                id: "g-1".into(),
                session_id: "global".into(),
                kind: UnitKind::Fact,
                status: UnitStatus::Active,
                topic: "t".into(),
                statement: "s".into(),
                fingerprint: "fp".into(),
                confidence: 0.5,
                source_refs: vec![],
                metadata: None,
                updated_at: now,
                last_seen_at: now,
            })
            .unwrap();

        // Two intervals elapsed → 0.5 * 0.5^2 = 0.125 < 0.3 → pruned.
        let pruned = e.run_decay_at(now).unwrap();
        assert_eq!(pruned, 1);
        assert!(f.store.global_units().is_empty());
    }

    #[test]
    fn refresh_publishes_working_snapshot() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        e.ingest_event(&truth_event(&f, "s1", "build", "uses cargo")).unwrap();

        let published = e.refresh_if_needed("s1").unwrap();
        assert!(published);
        let working = e.get_working_memory("s1");
        assert!(working.contains("uses cargo"));
        assert!(f.store.dir().join("working.md").exists());

        // Nothing dirty → no re-publish needed (same day, past-hour key set
        // only when crossed; make it deterministic with an early-morning now).
        let early = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        assert!(!e.refresh_at("s1", early).unwrap());
    }

    #[test]
    fn rebuild_replace_is_deterministic() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        let ev1 = truth_event(&f, "s1", "build", "uses cargo");
        let ev2 = truth_event(&f, "s1", "deploy", "staging first");
        e.ingest_event(&ev1).unwrap();
        e.ingest_event(&ev2).unwrap();
        // Drift: resolve one by hand.
        let mut drifted = f.store.active_session_units("s1")[0].clone();
        drifted.status = UnitStatus::Resolved;
        f.store.put_unit(&drifted).unwrap();

        let touched = e
            .rebuild_session_from_tape("s1", &[ev1, ev2], RebuildMode::Replace)
            .unwrap();
        assert_eq!(touched, 2);
        assert_eq!(f.store.active_session_units("s1").len(), 2);
    }

    #[test]
    fn external_recall_is_ingested() {
        let f = fixture();
        let e = engine(&f, MemoryConfig::default(), None);
        let n = e
            .ingest_external_recall(
                "s1",
                &[RecallItem {
                    topic: "prefs".into(),
                    statement: "user prefers terse answers".into(),
                    confidence: 0.8,
                }],
            )
            .unwrap();
        assert_eq!(n, 1);
        let block = e.build_recall_block("s1", "what does the user prefer", 3);
        assert!(block.unwrap().contains("terse"));
    }
}
