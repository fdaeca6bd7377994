//! Render-ready views derived from the roster.
//!
//! Nothing here writes back into the roster. The route line is shared by
//! `Arc` and passed through untouched; only participant points are derived.
//!
//! - [`derive_features`]: full derivation, linear in participant count
//! - [`IncrementalProjection`]: applies a [`RosterDelta`], touching only
//!   the ids it names
//! - [`PanelView`]: sorted rows for the results panel

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::participant::{Millis, ParticipantRecord, Position, Role};
use crate::roster::{Roster, RosterDelta};
use crate::route::RouteGeometry;

/// One participant marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointFeature {
    pub id: String,
    pub name: String,
    pub position: Position,
    pub bib: Option<u32>,
    pub finished: bool,
}

impl PointFeature {
    /// `None` when the participant has not reported a position yet.
    pub fn from_record(record: &ParticipantRecord) -> Option<Self> {
        let position = record.state.position?;
        Some(Self {
            id: record.identity.id.clone(),
            name: record.identity.name.clone(),
            position,
            bib: record.identity.bib,
            finished: record.state.finished,
        })
    }
}

/// Everything the map renderer needs for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderModel {
    pub route: Arc<RouteGeometry>,
    /// Sorted by participant id.
    pub points: Vec<PointFeature>,
    /// Participants without a position, excluded from `points`.
    pub pending: usize,
}

impl RenderModel {
    pub fn empty(route: Arc<RouteGeometry>) -> Self {
        Self {
            route,
            points: Vec::new(),
            pending: 0,
        }
    }

    /// Route as a GeoJSON `Feature`.
    pub fn route_feature(&self) -> Value {
        json!({
            "type": "Feature",
            "properties": {},
            "geometry": self.route.to_geojson(),
        })
    }

    /// Participants as a GeoJSON `FeatureCollection` of points, with
    /// `bib` and `finished` properties for styling.
    pub fn points_collection(&self) -> Value {
        let features: Vec<Value> = self
            .points
            .iter()
            .map(|p| {
                json!({
                    "type": "Feature",
                    "id": p.id,
                    "properties": {
                        "id": p.id,
                        "name": p.name,
                        "bib": p.bib,
                        "finished": p.finished,
                    },
                    "geometry": {
                        "type": "Point",
                        "coordinates": p.position.lng_lat(),
                    },
                })
            })
            .collect();
        json!({ "type": "FeatureCollection", "features": features })
    }
}

/// Derive the render model from a roster in one pass.
pub fn derive_features(roster: &Roster, route: &Arc<RouteGeometry>) -> RenderModel {
    let mut points = Vec::with_capacity(roster.len());
    let mut pending = 0;
    for record in roster.records() {
        match PointFeature::from_record(record) {
            Some(point) => points.push(point),
            None => pending += 1,
        }
    }
    points.sort_unstable_by(|a, b| a.id.cmp(&b.id));
    RenderModel {
        route: Arc::clone(route),
        points,
        pending,
    }
}

/// Render model maintained from roster deltas.
pub struct IncrementalProjection {
    route: Arc<RouteGeometry>,
    points: BTreeMap<String, PointFeature>,
    pending: BTreeSet<String>,
}

impl IncrementalProjection {
    pub fn new(route: Arc<RouteGeometry>) -> Self {
        Self {
            route,
            points: BTreeMap::new(),
            pending: BTreeSet::new(),
        }
    }

    pub fn route(&self) -> &Arc<RouteGeometry> {
        &self.route
    }

    /// Bring the projection up to date with `roster` for the ids in `delta`.
    ///
    /// `roster` may be newer than `delta`; ids touched by later deltas are
    /// refreshed again when those deltas arrive.
    pub fn apply(&mut self, roster: &Roster, delta: &RosterDelta) {
        if delta.replaced {
            self.rebuild(roster);
            return;
        }
        for id in delta.touched() {
            self.refresh(roster, id);
        }
    }

    /// Recompute every participant from scratch.
    pub fn rebuild(&mut self, roster: &Roster) {
        self.points.clear();
        self.pending.clear();
        for record in roster.records() {
            self.insert(record);
        }
    }

    fn refresh(&mut self, roster: &Roster, id: &str) {
        self.points.remove(id);
        self.pending.remove(id);
        if let Some(record) = roster.get(id) {
            self.insert(record);
        }
    }

    fn insert(&mut self, record: &ParticipantRecord) {
        match PointFeature::from_record(record) {
            Some(point) => {
                self.points.insert(point.id.clone(), point);
            }
            None => {
                self.pending.insert(record.identity.id.clone());
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn model(&self) -> RenderModel {
        RenderModel {
            route: Arc::clone(&self.route),
            points: self.points.values().cloned().collect(),
            pending: self.pending.len(),
        }
    }
}

/// One row of the results panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelRow {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub bib: Option<u32>,
    pub finished: bool,
    pub finish_rank: Option<u32>,
    pub speed: Option<f64>,
    pub distance: Option<f64>,
    pub last_update: Option<Millis>,
}

impl From<&ParticipantRecord> for PanelRow {
    fn from(record: &ParticipantRecord) -> Self {
        Self {
            id: record.identity.id.clone(),
            name: record.identity.name.clone(),
            role: record.identity.role,
            bib: record.identity.bib,
            finished: record.state.finished,
            finish_rank: record.state.finish_rank,
            speed: record.state.speed,
            distance: record.state.distance,
            last_update: record.state.last_update,
        }
    }
}

/// Results panel: who is running, who has finished, who is still silent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PanelView {
    /// Bib ascending (unnumbered last), then name.
    pub active: Vec<PanelRow>,
    /// Finish detection order.
    pub finished: Vec<PanelRow>,
    pub pending: usize,
}

impl PanelView {
    pub fn from_roster(roster: &Roster) -> Self {
        let mut active: Vec<PanelRow> = roster.active().values().map(PanelRow::from).collect();
        active.sort_by(|a, b| {
            (a.bib.is_none(), a.bib, &a.name, &a.id).cmp(&(b.bib.is_none(), b.bib, &b.name, &b.id))
        });

        let mut finished: Vec<PanelRow> = roster.finished().values().map(PanelRow::from).collect();
        finished.sort_by_key(|row| row.finish_rank.unwrap_or(u32::MAX));

        Self {
            active,
            finished,
            pending: roster.pending_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventEnvelope, RaceEvent};
    use crate::participant::Identity;
    use crate::reducer::reduce;

    fn route() -> Arc<RouteGeometry> {
        Arc::new(RouteGeometry::new(vec![[125.60, 7.10], [125.62, 7.12]]))
    }

    fn step(roster: Roster, event: RaceEvent) -> (Roster, RosterDelta) {
        reduce(roster, EventEnvelope::at(event, 1_000))
    }

    #[test]
    fn test_pending_participants_excluded_from_points() {
        let (roster, _) = step(Roster::default(), RaceEvent::Join(Identity::placeholder("a")));
        let (roster, _) = step(roster, RaceEvent::location("b", 7.1, 125.6));
        let model = derive_features(&roster, &route());
        assert_eq!(model.points.len(), 1);
        assert_eq!(model.points[0].id, "b");
        assert_eq!(model.pending, 1);
    }

    #[test]
    fn test_finished_participants_keep_their_marker() {
        let (roster, _) = step(Roster::default(), RaceEvent::location("a", 7.1, 125.6));
        let (roster, _) = step(roster, RaceEvent::finish("a"));
        let model = derive_features(&roster, &route());
        assert_eq!(model.points.len(), 1);
        assert!(model.points[0].finished);
    }

    #[test]
    fn test_route_is_shared_not_copied() {
        let route = route();
        let model = derive_features(&Roster::default(), &route);
        assert!(Arc::ptr_eq(&model.route, &route));
        assert_eq!(model.route_feature()["geometry"]["type"], "LineString");
    }

    #[test]
    fn test_incremental_matches_full_derivation() {
        let route = route();
        let mut projection = IncrementalProjection::new(Arc::clone(&route));
        let events = vec![
            RaceEvent::Join(Identity::new("a", "Ann", Role::Racer).with_bib(3)),
            RaceEvent::location("b", 7.1, 125.6),
            RaceEvent::location("a", 7.2, 125.7),
            RaceEvent::Join(Identity::placeholder("c")),
            RaceEvent::finish("b"),
            RaceEvent::leave("a"),
            RaceEvent::RoomSnapshot(vec![
                ParticipantRecord::new(Identity::placeholder("d")).with_position(7.0, 125.0),
                ParticipantRecord::new(Identity::placeholder("e")),
            ]),
            RaceEvent::location("e", 7.3, 125.3),
        ];

        let mut roster = Roster::default();
        for event in events {
            let (next, delta) = step(roster, event);
            roster = next;
            projection.apply(&roster, &delta);
            assert_eq!(projection.model(), derive_features(&roster, &route));
        }
        assert_eq!(projection.pending(), 0);
    }

    #[test]
    fn test_points_collection_geojson() {
        let (roster, _) = step(
            Roster::default(),
            RaceEvent::Join(Identity::new("a", "Ann", Role::Racer).with_bib(9)),
        );
        let (roster, _) = step(roster, RaceEvent::location("a", 7.1, 125.6));
        let collection = derive_features(&roster, &route()).points_collection();
        let feature = &collection["features"][0];
        assert_eq!(feature["properties"]["bib"], 9);
        assert_eq!(feature["properties"]["finished"], false);
        assert_eq!(feature["geometry"]["coordinates"][0], 125.6);
    }

    #[test]
    fn test_panel_ordering() {
        let mut roster = Roster::default();
        for event in [
            RaceEvent::Join(Identity::new("x", "Zed", Role::Racer)),
            RaceEvent::Join(Identity::new("y", "Yan", Role::Racer).with_bib(20)),
            RaceEvent::Join(Identity::new("z", "Abe", Role::Racer).with_bib(4)),
            RaceEvent::Join(Identity::new("w", "Wes", Role::Racer).with_bib(1)),
            RaceEvent::Join(Identity::new("v", "Val", Role::Racer).with_bib(2)),
            RaceEvent::finish("v"),
            RaceEvent::finish("w"),
        ] {
            roster = step(roster, event).0;
        }
        let panel = PanelView::from_roster(&roster);
        let active: Vec<&str> = panel.active.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(active, vec!["z", "y", "x"]);
        let finished: Vec<&str> = panel.finished.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(finished, vec!["v", "w"]);
        assert_eq!(panel.finished[0].finish_rank, Some(1));
        assert_eq!(panel.pending, 5);
    }
}
