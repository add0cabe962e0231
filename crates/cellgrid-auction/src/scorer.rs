//! Cell bids for placement decisions.
//!
//! A cell is eligible when its stack matches and one more container of the
//! requested size (memory, disk and file descriptors) fits in what it has
//! left. Eligible cells are then scored by a [`BidStrategy`]; the lowest
//! bid wins and ties go to the smaller cell ID so every auctioneer reaches
//! the same answer.

use std::collections::HashMap;

use cellgrid_state::{Capacity, ResourceRequest};

/// What a cell has left, as the auctioneer sees it during a round.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CellResources {
    pub cell_id: String,
    pub stack: String,
    pub total: Capacity,
    pub available: Capacity,
    /// Instances (running or ordered) per process GUID on this cell.
    pub process_instances: HashMap<String, u32>,
}

impl CellResources {
    /// Account for one more container of `req` owned by `process_guid`.
    pub fn commit(&mut self, req: &ResourceRequest, process_guid: Option<&str>) {
        self.available = self.available.minus(req);
        if let Some(guid) = process_guid {
            *self.process_instances.entry(guid.to_string()).or_default() += 1;
        }
    }
}

/// What is being placed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlacementRequest {
    /// Set for LRP instances; tasks have no siblings to spread from.
    pub process_guid: Option<String>,
    pub stack: String,
    pub resources: ResourceRequest,
}

/// A scored cell.
#[derive(Debug, Clone)]
pub struct Bid {
    pub cell_id: String,
    /// Lower is better.
    pub score: f64,
}

/// Scores an eligible cell for a placement. Lower wins.
pub trait BidStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, cell: &CellResources, req: &PlacementRequest) -> f64;
}

/// Whether `cell` can host `req` at all.
pub fn is_eligible(cell: &CellResources, req: &PlacementRequest) -> bool {
    cell.stack == req.stack && cell.available.fits(&req.resources)
}

/// Weights for [`LeastLoaded`].
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub memory: f64,
    pub disk: f64,
    pub containers: f64,
    /// Added per instance of the same process already on the cell.
    pub spread: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            memory: 0.4,
            disk: 0.2,
            containers: 0.4,
            spread: 1.0,
        }
    }
}

/// Prefers the cell that will be least full after placement, and cells
/// that do not already run the same process.
#[derive(Debug, Clone, Default)]
pub struct LeastLoaded {
    pub weights: ScoringWeights,
}

fn fullness(total: u64, available_after: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (total.saturating_sub(available_after) as f64 / total as f64).min(1.0)
}

impl BidStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn score(&self, cell: &CellResources, req: &PlacementRequest) -> f64 {
        let after = cell.available.minus(&req.resources);
        let memory = fullness(cell.total.memory_mb, after.memory_mb);
        let disk = fullness(cell.total.disk_mb, after.disk_mb);
        let containers = fullness(u64::from(cell.total.containers), u64::from(after.containers));
        let siblings = req
            .process_guid
            .as_ref()
            .and_then(|guid| cell.process_instances.get(guid))
            .copied()
            .unwrap_or(0);

        let w = &self.weights;
        w.memory * memory + w.disk * disk + w.containers * containers + w.spread * f64::from(siblings)
    }
}

/// Score every eligible cell and return bids best first.
pub fn rank_cells(
    cells: &[CellResources],
    req: &PlacementRequest,
    strategy: &dyn BidStrategy,
) -> Vec<Bid> {
    let mut bids: Vec<Bid> = cells
        .iter()
        .filter(|cell| is_eligible(cell, req))
        .map(|cell| Bid {
            cell_id: cell.cell_id.clone(),
            score: strategy.score(cell, req),
        })
        .collect();

    bids.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.cell_id.cmp(&b.cell_id))
    });
    bids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cell(id: &str, mem_total: u64, mem_free: u64, containers_free: u32) -> CellResources {
        CellResources {
            cell_id: id.to_string(),
            stack: "linux".to_string(),
            total: Capacity::new(mem_total, 1024, 4096, 10),
            available: Capacity::new(mem_free, 1024, 4096, containers_free),
            process_instances: HashMap::new(),
        }
    }

    fn request(mem: u64) -> PlacementRequest {
        PlacementRequest {
            process_guid: Some("web".to_string()),
            stack: "linux".to_string(),
            resources: ResourceRequest {
                memory_mb: mem,
                disk_mb: 10,
                file_descriptors: 64,
            },
        }
    }

    #[test]
    fn rejects_wrong_stack() {
        let mut cell = make_cell("c1", 1024, 1024, 10);
        cell.stack = "windows".to_string();
        assert!(!is_eligible(&cell, &request(128)));
    }

    #[test]
    fn rejects_insufficient_memory() {
        let cell = make_cell("c1", 1024, 100, 10);
        assert!(!is_eligible(&cell, &request(128)));
    }

    #[test]
    fn rejects_full_container_slots() {
        let cell = make_cell("c1", 1024, 1024, 0);
        assert!(!is_eligible(&cell, &request(128)));
    }

    #[test]
    fn rejects_insufficient_file_descriptors() {
        let mut cell = make_cell("c1", 1024, 1024, 10);
        cell.available.file_descriptors = 32;
        assert!(!is_eligible(&cell, &request(128)));
    }

    #[test]
    fn prefers_emptier_cell() {
        let cells = vec![make_cell("c1", 1024, 200, 5), make_cell("c2", 1024, 900, 5)];
        let bids = rank_cells(&cells, &request(128), &LeastLoaded::default());
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].cell_id, "c2");
        assert!(bids[0].score < bids[1].score);
    }

    #[test]
    fn spread_penalizes_siblings() {
        let mut busy = make_cell("c1", 1024, 1024, 10);
        busy.process_instances.insert("web".to_string(), 1);
        let idle = make_cell("c2", 1024, 1024, 10);
        let bids = rank_cells(&[busy, idle], &request(128), &LeastLoaded::default());
        assert_eq!(bids[0].cell_id, "c2");
    }

    #[test]
    fn ties_break_on_cell_id() {
        let cells = vec![make_cell("c2", 1024, 1024, 10), make_cell("c1", 1024, 1024, 10)];
        let bids = rank_cells(&cells, &request(128), &LeastLoaded::default());
        assert_eq!(bids[0].cell_id, "c1");
        assert_eq!(bids[0].score, bids[1].score);
    }

    #[test]
    fn commit_consumes_capacity() {
        let mut cell = make_cell("c1", 1024, 256, 2);
        let req = request(128);
        cell.commit(&req.resources, Some("web"));
        cell.commit(&req.resources, Some("web"));
        assert_eq!(cell.available.memory_mb, 0);
        assert_eq!(cell.available.containers, 0);
        assert_eq!(cell.process_instances["web"], 2);
        assert!(!is_eligible(&cell, &req));
    }

    struct Fixed(f64);

    impl BidStrategy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn score(&self, _cell: &CellResources, _req: &PlacementRequest) -> f64 {
            self.0
        }
    }

    #[test]
    fn custom_strategy_is_used() {
        let cells = vec![make_cell("b", 1024, 1024, 10), make_cell("a", 1024, 1024, 10)];
        let bids = rank_cells(&cells, &request(128), &Fixed(7.0));
        assert!(bids.iter().all(|b| b.score == 7.0));
        assert_eq!(bids[0].cell_id, "a");
    }
}
