//! Deterministic in-memory geometry kernel.
//!
//! Models just enough of a meshing engine to exercise the bridge end to end:
//! boxes made of volumes, surfaces, curves and vertices, a command journal,
//! and a diagnostic log written to the negotiated log path.

use std::fs::OpenOptions;
use std::io::Write;

use crate::protocol::{AttributeInfo, GeometryKind, Parameters};

use super::{log_path_from_args, Engine, EngineError, EngineValue};

/// Reference to one entity in the sandbox arena. Index 0 is the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef(usize);

#[derive(Debug)]
enum Entity {
    Root,
    Volume {
        id: i64,
        dims: [f64; 3],
        surfaces: Vec<EntityRef>,
        curves: Vec<EntityRef>,
        vertices: Vec<EntityRef>,
    },
    Surface {
        id: i64,
        area: f64,
        curves: Vec<EntityRef>,
    },
    Curve {
        id: i64,
        length: f64,
        vertices: [EntityRef; 2],
    },
    Vertex {
        id: i64,
        coords: [f64; 3],
    },
}

impl Entity {
    fn type_name(&self) -> &'static str {
        match self {
            Entity::Root => "engine",
            Entity::Volume { .. } => "volume",
            Entity::Surface { .. } => "surface",
            Entity::Curve { .. } => "curve",
            Entity::Vertex { .. } => "vertex",
        }
    }

    fn kind(&self) -> Option<GeometryKind> {
        match self {
            Entity::Root => None,
            Entity::Volume { .. } => Some(GeometryKind::Volume),
            Entity::Surface { .. } => Some(GeometryKind::Surface),
            Entity::Curve { .. } => Some(GeometryKind::Curve),
            Entity::Vertex { .. } => Some(GeometryKind::Vertex),
        }
    }

    fn entity_id(&self) -> Option<i64> {
        match self {
            Entity::Root => None,
            Entity::Volume { id, .. }
            | Entity::Surface { id, .. }
            | Entity::Curve { id, .. }
            | Entity::Vertex { id, .. } => Some(*id),
        }
    }
}

const ROOT_MEMBERS: &[(&str, bool)] = &[
    ("makeBox", true),
    ("cmd", true),
    ("echo", true),
    ("get_volume_count", true),
    ("fail", true),
    ("version", false),
];
const VOLUME_MEMBERS: &[(&str, bool)] = &[
    ("id", true),
    ("volume", true),
    ("surfaces", true),
    ("curves", true),
    ("vertices", true),
    ("summary", true),
    ("mesh", true),
    ("name", false),
];
const SURFACE_MEMBERS: &[(&str, bool)] = &[("id", true), ("area", true), ("curves", true)];
const CURVE_MEMBERS: &[(&str, bool)] = &[("id", true), ("length", true), ("vertices", true)];
const VERTEX_MEMBERS: &[(&str, bool)] = &[("id", true), ("coordinates", true)];

type Value = EngineValue<EntityRef>;

/// In-memory engine. Entities are never freed; registry deletes only drop
/// the bridge's reference.
#[derive(Debug)]
pub struct SandboxEngine {
    entities: Vec<Entity>,
    next_ids: [i64; 4],
    log_path: Option<String>,
    journal: Vec<String>,
    initialized: bool,
}

impl Default for SandboxEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxEngine {
    pub fn new() -> Self {
        Self {
            entities: vec![Entity::Root],
            next_ids: [1; 4],
            log_path: None,
            journal: Vec::new(),
            initialized: false,
        }
    }

    /// Commands passed to `cmd`, in order.
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    fn entity(&self, r: EntityRef) -> Result<&Entity, EngineError> {
        self.entities
            .get(r.0)
            .ok_or_else(|| EngineError::Raised(format!("dangling entity reference {}", r.0)))
    }

    fn next_id(&mut self, kind: GeometryKind) -> i64 {
        let slot = match kind {
            GeometryKind::Vertex => 0,
            GeometryKind::Curve => 1,
            GeometryKind::Surface => 2,
            GeometryKind::Volume => 3,
        };
        let id = self.next_ids[slot];
        self.next_ids[slot] += 1;
        id
    }

    fn push(&mut self, entity: Entity) -> EntityRef {
        self.entities.push(entity);
        EntityRef(self.entities.len() - 1)
    }

    fn diagnostic(&self, line: &str) {
        let Some(path) = &self.log_path else {
            return;
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = written {
            tracing::warn!("Failed to write engine log {}: {}", path, e);
        }
    }

    fn make_box(&mut self, dims: [f64; 3]) -> EntityRef {
        let half = dims.map(|d| d / 2.0);

        // Vertex i sits at the corner selected by its x/y/z bits.
        let mut vertices = Vec::with_capacity(8);
        for i in 0..8usize {
            let coords = [0usize, 1, 2].map(|axis| {
                if i & (1 << axis) == 0 {
                    -half[axis]
                } else {
                    half[axis]
                }
            });
            let id = self.next_id(GeometryKind::Vertex);
            vertices.push(self.push(Entity::Vertex { id, coords }));
        }

        // One edge per pair of corners that differ in exactly one bit.
        let mut edges: Vec<(usize, usize, usize)> = Vec::with_capacity(12);
        for i in 0..8usize {
            for axis in 0..3 {
                if i & (1 << axis) == 0 {
                    edges.push((i, i | (1 << axis), axis));
                }
            }
        }
        let mut curves = Vec::with_capacity(12);
        for &(a, b, axis) in &edges {
            let id = self.next_id(GeometryKind::Curve);
            curves.push(self.push(Entity::Curve {
                id,
                length: dims[axis],
                vertices: [vertices[a], vertices[b]],
            }));
        }

        let mut surfaces = Vec::with_capacity(6);
        for axis in 0..3 {
            for side in [0, 1 << axis] {
                let on_face = |corner: usize| corner & (1 << axis) == side;
                let face_curves = edges
                    .iter()
                    .zip(&curves)
                    .filter(|((a, b, _), _)| on_face(*a) && on_face(*b))
                    .map(|(_, c)| *c)
                    .collect();
                let area = dims[(axis + 1) % 3] * dims[(axis + 2) % 3];
                let id = self.next_id(GeometryKind::Surface);
                surfaces.push(self.push(Entity::Surface {
                    id,
                    area,
                    curves: face_curves,
                }));
            }
        }

        let id = self.next_id(GeometryKind::Volume);
        self.diagnostic(&format!(
            "Created volume {} ({} x {} x {})",
            id, dims[0], dims[1], dims[2]
        ));
        self.push(Entity::Volume {
            id,
            dims,
            surfaces,
            curves,
            vertices,
        })
    }

    fn volume_count(&self) -> i64 {
        self.entities
            .iter()
            .filter(|e| matches!(e, Entity::Volume { .. }))
            .count() as i64
    }

    fn invoke_root(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        match name {
            "makeBox" => {
                let dims = positive_dims(&args)?;
                Ok(Value::Object(self.make_box(dims)))
            }
            "cmd" => {
                let text = single_str(name, &args)?.to_string();
                self.diagnostic(&format!("Journaled Command: {}", text));
                self.journal.push(text);
                Ok(Value::none())
            }
            "echo" => Ok(Value::List(args)),
            "get_volume_count" => {
                no_args(name, &args)?;
                Ok(Value::int(self.volume_count()))
            }
            "fail" => {
                let message = args
                    .first()
                    .and_then(|a| a.as_str())
                    .unwrap_or("requested failure");
                self.diagnostic(&format!("ERROR: {}", message));
                Err(EngineError::Raised(message.to_string()))
            }
            "version" => {
                no_args(name, &args)?;
                Ok(Value::str(format!("sandbox {}", env!("CARGO_PKG_VERSION"))))
            }
            _ => Err(no_attribute("engine", name)),
        }
    }

    fn invoke_entity(&self, target: EntityRef, name: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        let entity = self.entity(target)?;
        let type_name = entity.type_name();

        let result = match (entity, name) {
            (_, "id") => Value::int(entity.entity_id().unwrap_or_default()),
            (Entity::Volume { dims, .. }, "volume") => Value::float(dims.iter().product()),
            (Entity::Volume { surfaces, .. }, "surfaces") => objects(surfaces),
            (Entity::Volume { curves, .. }, "curves") => objects(curves),
            (Entity::Volume { vertices, .. }, "vertices") => objects(vertices),
            (Entity::Volume { id, surfaces, .. }, "summary") => {
                let first = surfaces.first().copied();
                let last = surfaces.last().copied();
                Value::List(vec![
                    Value::str(format!("volume {}", id)),
                    Value::List(first.into_iter().chain(last).map(Value::Object).collect()),
                    Value::int(surfaces.len() as i64),
                ])
            }
            (Entity::Volume { id, .. }, "name") => Value::str(format!("volume {}", id)),
            (Entity::Volume { id, .. }, "mesh") => {
                let line = format!("Meshing volume {} ... done", id);
                no_args(name, &args)?;
                self.diagnostic(&line);
                return Ok(Value::none());
            }
            (Entity::Surface { area, .. }, "area") => Value::float(*area),
            (Entity::Surface { curves, .. }, "curves") => objects(curves),
            (Entity::Curve { length, .. }, "length") => Value::float(*length),
            (Entity::Curve { vertices, .. }, "vertices") => objects(vertices),
            (Entity::Vertex { coords, .. }, "coordinates") => {
                Value::List(coords.iter().map(|c| Value::float(*c)).collect())
            }
            _ => return Err(no_attribute(type_name, name)),
        };
        no_args(name, &args)?;
        Ok(result)
    }
}

impl Engine for SandboxEngine {
    type Object = EntityRef;

    fn load(&mut self, params: &Parameters) -> Result<(), EngineError> {
        self.log_path = params.log_path.clone();
        tracing::debug!(library_path = %params.library_path, "sandbox engine needs no library");
        Ok(())
    }

    fn init(&mut self, args: &[String]) -> Result<EntityRef, EngineError> {
        if self.initialized {
            return Err(EngineError::Raised("engine already initialized".to_string()));
        }
        if self.log_path.is_none() {
            self.log_path = log_path_from_args(args);
        }
        self.initialized = true;
        self.diagnostic(&format!("Sandbox engine started with {:?}", args));
        Ok(EntityRef(0))
    }

    fn identity(&self, obj: &EntityRef) -> u64 {
        obj.0 as u64
    }

    fn describe(&self, obj: &EntityRef) -> String {
        match self.entities.get(obj.0) {
            Some(Entity::Root) => "engine".to_string(),
            Some(entity) => format!(
                "{} {}",
                entity.type_name(),
                entity.entity_id().unwrap_or_default()
            ),
            None => format!("<dangling {}>", obj.0),
        }
    }

    fn attributes(&self, obj: &EntityRef) -> Result<Vec<AttributeInfo>, EngineError> {
        let members = match self.entity(*obj)? {
            Entity::Root => ROOT_MEMBERS,
            Entity::Volume { .. } => VOLUME_MEMBERS,
            Entity::Surface { .. } => SURFACE_MEMBERS,
            Entity::Curve { .. } => CURVE_MEMBERS,
            Entity::Vertex { .. } => VERTEX_MEMBERS,
        };
        Ok(members
            .iter()
            .map(|(name, callable)| AttributeInfo {
                name: name.to_string(),
                callable: *callable,
            })
            .collect())
    }

    fn invoke(&mut self, obj: &EntityRef, name: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        if !self.initialized {
            return Err(EngineError::Raised("engine not initialized".to_string()));
        }
        match self.entity(*obj)? {
            Entity::Root => self.invoke_root(name, args),
            _ => self.invoke_entity(*obj, name, args),
        }
    }

    fn is_kind(&self, obj: &EntityRef, kind: GeometryKind) -> bool {
        self.entities
            .get(obj.0)
            .and_then(Entity::kind)
            .is_some_and(|k| k == kind)
    }
}

fn objects(refs: &[EntityRef]) -> Value {
    Value::List(refs.iter().copied().map(Value::Object).collect())
}

fn no_attribute(type_name: &str, name: &str) -> EngineError {
    EngineError::Raised(format!("'{}' object has no attribute '{}'", type_name, name))
}

fn no_args(name: &str, args: &[Value]) -> Result<(), EngineError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Raised(format!(
            "{}() takes no arguments ({} given)",
            name,
            args.len()
        )))
    }
}

fn single_str<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, EngineError> {
    match args {
        [value] => value
            .as_str()
            .ok_or_else(|| EngineError::Raised(format!("{}() expects a string", name))),
        _ => Err(EngineError::Raised(format!(
            "{}() takes exactly one argument ({} given)",
            name,
            args.len()
        ))),
    }
}

fn positive_dims(args: &[Value]) -> Result<[f64; 3], EngineError> {
    let dims: Vec<f64> = args.iter().filter_map(Value::as_f64).collect();
    match dims.as_slice() {
        [w, h, d] if args.len() == 3 && dims.iter().all(|v| *v > 0.0) => Ok([*w, *h, *d]),
        _ => Err(EngineError::Raised(
            "makeBox() expects three positive dimensions".to_string(),
        )),
    }
}
