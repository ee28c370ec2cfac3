//! Map definitions: static collision geometry and spawn points

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ws::protocol::Vec3;

/// One triangle mesh of static geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshDefinition {
    pub vertices: Vec<[f32; 3]>,
    pub indices: Vec<[u32; 3]>,
}

/// Map as exported by the authoring tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDefinition {
    pub id: String,
    /// Spawn point per player slot (only the first two are used)
    pub spawn_points: Vec<Vec3>,
    pub meshes: Vec<MeshDefinition>,
}

/// Half extent of the fallback floor (m)
pub const FALLBACK_FLOOR_HALF_EXTENT: f32 = 100.0;

impl MapDefinition {
    /// Load `<dir>/<map_id>.json` and validate it
    pub fn load(dir: &Path, map_id: &str) -> Result<Self, MapError> {
        let path = dir.join(format!("{map_id}.json"));
        let raw = fs::read_to_string(&path).map_err(|source| MapError::Io {
            path: path.clone(),
            source,
        })?;
        let map: MapDefinition =
            serde_json::from_str(&raw).map_err(|source| MapError::Parse { path, source })?;
        map.validate()?;
        Ok(map)
    }

    /// Load a map, falling back to a flat floor if anything goes wrong.
    /// Returns the map and whether it is the fallback.
    pub fn load_or_fallback(dir: &Path, map_id: &str) -> (Self, bool) {
        match Self::load(dir, map_id) {
            Ok(map) => {
                info!(
                    map_id = %map.id,
                    meshes = map.meshes.len(),
                    "Loaded map geometry"
                );
                (map, false)
            }
            Err(e) => {
                warn!(map_id = %map_id, error = %e, "Map load failed, running in degraded mode on a fallback floor");
                (Self::fallback(map_id), true)
            }
        }
    }

    /// Geometry-less map with default spawns. The physics world adds a flat
    /// floor (top surface at y = 0) in place of the missing meshes.
    pub fn fallback(map_id: &str) -> Self {
        Self {
            id: map_id.to_string(),
            spawn_points: vec![Vec3::new(0.0, 1.0, 10.0), Vec3::new(0.0, 1.0, -10.0)],
            meshes: Vec::new(),
        }
    }

    pub fn spawn_point(&self, slot: usize) -> Vec3 {
        self.spawn_points
            .get(slot)
            .copied()
            .unwrap_or_else(|| Vec3::new(0.0, 1.0, if slot == 0 { 10.0 } else { -10.0 }))
    }

    fn validate(&self) -> Result<(), MapError> {
        if self.spawn_points.len() < 2 {
            return Err(MapError::Invalid("at least two spawn points are required".into()));
        }
        if self.spawn_points.iter().any(|p| !p.is_finite()) {
            return Err(MapError::Invalid("spawn point is not finite".into()));
        }
        if self.meshes.is_empty() {
            return Err(MapError::Invalid("map has no collision meshes".into()));
        }
        for (i, mesh) in self.meshes.iter().enumerate() {
            if mesh.indices.is_empty() {
                return Err(MapError::Invalid(format!("mesh {i} has no triangles")));
            }
            let count = mesh.vertices.len() as u32;
            if mesh.indices.iter().flatten().any(|&idx| idx >= count) {
                return Err(MapError::Invalid(format!("mesh {i} indexes past its vertices")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("Failed to read map file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse map file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid map: {0}")]
    Invalid(String),
}
