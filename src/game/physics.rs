//! Physics world - rapier3d wrapper for map geometry, player capsules and grenades
//!
//! The world knows nothing about game rules. Every collider is tagged with a
//! [`BodyOwner`] so queries can tell map geometry, players and grenades apart.

use std::collections::HashMap;

use parking_lot::Mutex;
use rapier3d::prelude::*;
use tracing::debug;

use crate::util::time::tick_delta;
use crate::ws::protocol::Vec3;

use super::grenades::GrenadeId;
use super::map::{MapDefinition, MapError, FALLBACK_FLOOR_HALF_EXTENT};
use super::player::PlayerSlot;

pub const GRAVITY: Real = -20.0;
pub const PLAYER_RADIUS: Real = 0.4;
/// Half height of the capsule's cylindrical part
pub const PLAYER_HALF_HEIGHT: Real = 0.5;
pub const PLAYER_MASS: Real = 80.0;
/// Eye offset above the body centre
pub const EYE_HEIGHT: Real = 0.6;
pub const GRENADE_RADIUS: Real = 0.1;
const GRENADE_MASS: Real = 0.4;
const PLAYER_LINEAR_DAMPING: Real = 0.5;
/// Ground probe reaches this far past the capsule bottom
const GROUND_PROBE_MARGIN: Real = 0.1;

const WORLD_GROUP: Group = Group::GROUP_1;
const PLAYER_GROUP: Group = Group::GROUP_2;
const GRENADE_GROUP: Group = Group::GROUP_3;

/// What a collider belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOwner {
    World,
    Player(PlayerSlot),
    Grenade(GrenadeId),
}

/// Nearest hit of a ray cast
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub point: Vector<Real>,
    pub distance: Real,
    pub owner: BodyOwner,
}

/// A grenade touched something during the last step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrenadeContact {
    pub grenade: GrenadeId,
    pub other: BodyOwner,
}

/// Collects collision starts during a step
#[derive(Default)]
struct CollisionCollector {
    started: Mutex<Vec<(ColliderHandle, ColliderHandle)>>,
}

impl EventHandler for CollisionCollector {
    fn handle_collision_event(
        &self,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        event: CollisionEvent,
        _contact_pair: Option<&ContactPair>,
    ) {
        if let CollisionEvent::Started(a, b, _) = event {
            self.started.lock().push((a, b));
        }
    }

    fn handle_contact_force_event(
        &self,
        _dt: Real,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        _contact_pair: &ContactPair,
        _total_force_magnitude: Real,
    ) {
    }
}

/// Grenades pass through the player who threw them.
/// Player colliders carry their slot in `user_data`, grenades their owner's.
struct ThrowerPassThrough;

impl PhysicsHooks for ThrowerPassThrough {
    fn filter_contact_pair(&self, context: &PairFilterContext) -> Option<SolverFlags> {
        let a = &context.colliders[context.collider1];
        let b = &context.colliders[context.collider2];
        if thrown_by(a, b) || thrown_by(b, a) {
            None
        } else {
            Some(SolverFlags::COMPUTE_IMPULSES)
        }
    }
}

fn thrown_by(grenade: &Collider, player: &Collider) -> bool {
    grenade.collision_groups().memberships.contains(GRENADE_GROUP)
        && player.collision_groups().memberships.contains(PLAYER_GROUP)
        && grenade.user_data == player.user_data
}

pub struct PhysicsWorld {
    bodies: RigidBodySet,
    colliders: ColliderSet,
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
    events: CollisionCollector,
    hooks: ThrowerPassThrough,
    owners: HashMap<ColliderHandle, BodyOwner>,
    steps: u64,
}

impl PhysicsWorld {
    pub fn new() -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = tick_delta();

        Self {
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            gravity: vector![0.0, GRAVITY, 0.0],
            integration_parameters,
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            events: CollisionCollector::default(),
            hooks: ThrowerPassThrough,
            owners: HashMap::new(),
            steps: 0,
        }
    }

    /// Insert the map meshes as static trimesh colliders.
    /// Index bounds are checked when the map is loaded.
    pub fn load_map(&mut self, map: &MapDefinition) -> Result<usize, MapError> {
        if map.meshes.is_empty() {
            return Err(MapError::Invalid("map has no collision meshes".into()));
        }

        for mesh in &map.meshes {
            let vertices: Vec<Point<Real>> = mesh
                .vertices
                .iter()
                .map(|v| point![v[0], v[1], v[2]])
                .collect();
            let collider = ColliderBuilder::trimesh(vertices, mesh.indices.clone())
                .collision_groups(InteractionGroups::new(WORLD_GROUP, Group::ALL))
                .build();
            let handle = self.colliders.insert(collider);
            self.owners.insert(handle, BodyOwner::World);
        }
        Ok(map.meshes.len())
    }

    /// Flat static floor with its top surface at y = 0
    pub fn add_fallback_floor(&mut self) {
        let e = FALLBACK_FLOOR_HALF_EXTENT;
        let collider = ColliderBuilder::cuboid(e, 0.5, e)
            .translation(vector![0.0, -0.5, 0.0])
            .collision_groups(InteractionGroups::new(WORLD_GROUP, Group::ALL))
            .build();
        let handle = self.colliders.insert(collider);
        self.owners.insert(handle, BodyOwner::World);
    }

    /// Advance the simulation by one fixed timestep.
    /// Returns the grenade contacts that started during the step.
    pub fn step(&mut self) -> Vec<GrenadeContact> {
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &self.hooks,
            &self.events,
        );
        self.steps += 1;

        let started = std::mem::take(&mut *self.events.started.lock());
        started
            .into_iter()
            .filter_map(|(a, b)| {
                let owner_a = self.owner_of(a);
                let owner_b = self.owner_of(b);
                match (owner_a, owner_b) {
                    (BodyOwner::Grenade(grenade), other) | (other, BodyOwner::Grenade(grenade)) => {
                        Some(GrenadeContact { grenade, other })
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Dynamic capsule with locked rotations and continuous collision detection
    pub fn create_player_body(&mut self, slot: PlayerSlot, spawn: Vec3) -> RigidBodyHandle {
        let body = RigidBodyBuilder::dynamic()
            .translation(vector![spawn.x, spawn.y, spawn.z])
            .lock_rotations()
            .ccd_enabled(true)
            .can_sleep(false)
            .linear_damping(PLAYER_LINEAR_DAMPING)
            .build();
        let handle = self.bodies.insert(body);

        let collider = ColliderBuilder::capsule_y(PLAYER_HALF_HEIGHT, PLAYER_RADIUS)
            .mass(PLAYER_MASS)
            .friction(0.0)
            .friction_combine_rule(CoefficientCombineRule::Min)
            .user_data(slot as u128)
            .collision_groups(InteractionGroups::new(
                PLAYER_GROUP,
                WORLD_GROUP | PLAYER_GROUP | GRENADE_GROUP,
            ))
            .build();
        let collider = self
            .colliders
            .insert_with_parent(collider, handle, &mut self.bodies);
        self.owners.insert(collider, BodyOwner::Player(slot));

        debug!(slot, "Created player body");
        handle
    }

    /// Dynamic sphere reporting collision events. It never touches `owner`.
    pub fn create_grenade_body(
        &mut self,
        id: GrenadeId,
        owner: PlayerSlot,
        position: Vector<Real>,
        velocity: Vector<Real>,
    ) -> RigidBodyHandle {
        let body = RigidBodyBuilder::dynamic()
            .translation(position)
            .linvel(velocity)
            .ccd_enabled(true)
            .build();
        let handle = self.bodies.insert(body);

        let collider = ColliderBuilder::ball(GRENADE_RADIUS)
            .mass(GRENADE_MASS)
            .restitution(0.3)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS)
            .user_data(owner as u128)
            .collision_groups(InteractionGroups::new(
                GRENADE_GROUP,
                WORLD_GROUP | PLAYER_GROUP,
            ))
            .build();
        let collider = self
            .colliders
            .insert_with_parent(collider, handle, &mut self.bodies);
        self.owners.insert(collider, BodyOwner::Grenade(id));
        handle
    }

    /// Remove a body and all of its colliders
    pub fn remove_body(&mut self, handle: RigidBodyHandle) {
        if let Some(body) = self.bodies.get(handle) {
            for collider in body.colliders() {
                self.owners.remove(collider);
            }
        }
        self.bodies.remove(
            handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
    }

    /// Freeze (disable simulation, collision and queries) or re-enable a body
    pub fn set_body_active(&mut self, handle: RigidBodyHandle, active: bool) {
        if let Some(body) = self.bodies.get_mut(handle) {
            if !active {
                body.set_linvel(Vector::zeros(), false);
            }
            body.set_enabled(active);
        }
    }

    #[cfg(test)]
    pub fn is_body_active(&self, handle: RigidBodyHandle) -> bool {
        self.bodies.get(handle).map(|b| b.is_enabled()).unwrap_or(false)
    }

    /// Move a body and zero its velocity
    pub fn teleport(&mut self, handle: RigidBodyHandle, position: Vec3) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_translation(vector![position.x, position.y, position.z], true);
            body.set_linvel(Vector::zeros(), true);
        }
    }

    /// Pin a body where it is and stop it colliding (sticky grenades)
    pub fn stick_body(&mut self, handle: RigidBodyHandle) {
        let Some(body) = self.bodies.get_mut(handle) else {
            return;
        };
        body.set_linvel(Vector::zeros(), false);
        body.set_body_type(RigidBodyType::Fixed, true);
        for &collider in body.colliders() {
            if let Some(collider) = self.colliders.get_mut(collider) {
                collider.set_collision_groups(InteractionGroups::none());
            }
        }
    }

    /// Move a pinned body along with whatever it is stuck to
    pub fn set_body_position(&mut self, handle: RigidBodyHandle, position: Vector<Real>) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_translation(position, true);
        }
    }

    pub fn body_position(&self, handle: RigidBodyHandle) -> Option<Vector<Real>> {
        self.bodies.get(handle).map(|b| *b.translation())
    }

    pub fn body_velocity(&self, handle: RigidBodyHandle) -> Option<Vector<Real>> {
        self.bodies.get(handle).map(|b| *b.linvel())
    }

    pub fn set_body_velocity(&mut self, handle: RigidBodyHandle, velocity: Vector<Real>) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_linvel(velocity, true);
        }
    }

    pub fn apply_impulse(&mut self, handle: RigidBodyHandle, impulse: Vector<Real>) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.apply_impulse(impulse, true);
        }
    }

    /// Nearest world or player collider along the ray. Grenades are ignored.
    pub fn cast_ray(
        &self,
        origin: Vector<Real>,
        direction: Vector<Real>,
        max_distance: Real,
        solid: bool,
        exclude: Option<RigidBodyHandle>,
    ) -> Option<RayHit> {
        let direction = direction.try_normalize(1.0e-6)?;
        let ray = Ray::new(Point::from(origin), direction);

        let queryable = |_: ColliderHandle, collider: &Collider| self.is_queryable(collider);
        let mut filter = QueryFilter::default()
            .groups(InteractionGroups::new(Group::ALL, WORLD_GROUP | PLAYER_GROUP))
            .predicate(&queryable);
        if let Some(body) = exclude {
            filter = filter.exclude_rigid_body(body);
        }

        let (collider, toi) = self.query_pipeline.cast_ray(
            &self.bodies,
            &self.colliders,
            &ray,
            max_distance,
            solid,
            filter,
        )?;

        Some(RayHit {
            point: ray.point_at(toi).coords,
            distance: toi,
            owner: self.owner_of(collider),
        })
    }

    /// Every collider intersecting the sphere
    pub fn query_sphere_overlap(
        &self,
        center: Vector<Real>,
        radius: Real,
    ) -> Vec<(ColliderHandle, BodyOwner)> {
        let shape = Ball::new(radius);
        let shape_pos = Isometry::translation(center.x, center.y, center.z);
        let queryable = |_: ColliderHandle, collider: &Collider| self.is_queryable(collider);
        let mut hits = Vec::new();
        self.query_pipeline.intersections_with_shape(
            &self.bodies,
            &self.colliders,
            &shape_pos,
            &shape,
            QueryFilter::default().predicate(&queryable),
            |handle| {
                hits.push((handle, self.owner_of(handle)));
                true
            },
        );
        hits
    }

    /// Short downward probe from the centre of the capsule's lower sphere
    pub fn is_grounded(&self, handle: RigidBodyHandle) -> bool {
        let Some(center) = self.body_position(handle) else {
            return false;
        };
        let origin = center - vector![0.0, PLAYER_HALF_HEIGHT, 0.0];
        self.cast_ray(
            origin,
            vector![0.0, -1.0, 0.0],
            PLAYER_RADIUS + GROUND_PROBE_MARGIN,
            true,
            Some(handle),
        )
        .is_some()
    }

    #[cfg(test)]
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Disabled bodies stay in the query structure until removed
    fn is_queryable(&self, collider: &Collider) -> bool {
        collider.is_enabled()
            && collider
                .parent()
                .map_or(true, |parent| self.bodies.get(parent).is_some_and(|b| b.is_enabled()))
    }

    fn owner_of(&self, collider: ColliderHandle) -> BodyOwner {
        self.owners.get(&collider).copied().unwrap_or(BodyOwner::World)
    }
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Eye position for a body centre
pub fn eye_position(center: Vector<Real>) -> Vector<Real> {
    center + vector![0.0, EYE_HEIGHT, 0.0]
}

pub fn to_vector(v: Vec3) -> Vector<Real> {
    vector![v.x, v.y, v.z]
}

pub fn to_wire(v: &Vector<Real>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Capsule centre height when standing on the y = 0 floor
    const STANDING_Y: f32 = PLAYER_HALF_HEIGHT + PLAYER_RADIUS;

    fn floor_world() -> PhysicsWorld {
        let mut world = PhysicsWorld::new();
        world.add_fallback_floor();
        world
    }

    fn settle(world: &mut PhysicsWorld, steps: usize) {
        for _ in 0..steps {
            world.step();
        }
    }

    #[test]
    fn player_settles_on_floor_and_is_grounded() {
        let mut world = floor_world();
        let body = world.create_player_body(0, Vec3::new(0.0, STANDING_Y + 0.5, 0.0));
        settle(&mut world, 90);

        let pos = world.body_position(body).unwrap();
        assert!((pos.y - STANDING_Y).abs() < 0.1, "y = {}", pos.y);
        assert!(world.is_grounded(body));
    }

    #[test]
    fn airborne_player_is_not_grounded() {
        let mut world = floor_world();
        let body = world.create_player_body(0, Vec3::new(0.0, 10.0, 0.0));
        settle(&mut world, 1);
        assert!(!world.is_grounded(body));
    }

    #[test]
    fn ray_identifies_player_hit() {
        let mut world = floor_world();
        let shooter = world.create_player_body(0, Vec3::new(0.0, STANDING_Y, 5.0));
        world.create_player_body(1, Vec3::new(0.0, STANDING_Y, -5.0));
        settle(&mut world, 2);

        let origin = world.body_position(shooter).unwrap();
        let hit = world
            .cast_ray(origin, vector![0.0, 0.0, -1.0], 50.0, true, Some(shooter))
            .unwrap();
        assert_eq!(hit.owner, BodyOwner::Player(1));
        assert!((hit.distance - (10.0 - PLAYER_RADIUS)).abs() < 0.2);
    }

    #[test]
    fn ray_hits_floor_as_world() {
        let mut world = floor_world();
        settle(&mut world, 1);
        let hit = world
            .cast_ray(vector![0.0, 5.0, 0.0], vector![0.0, -1.0, 0.0], 10.0, true, None)
            .unwrap();
        assert_eq!(hit.owner, BodyOwner::World);
        assert!((hit.distance - 5.0).abs() < 1.0e-3);
    }

    #[test]
    fn ray_respects_max_distance() {
        let mut world = floor_world();
        settle(&mut world, 1);
        assert!(world
            .cast_ray(vector![0.0, 5.0, 0.0], vector![0.0, -1.0, 0.0], 2.0, true, None)
            .is_none());
    }

    #[test]
    fn sphere_overlap_finds_nearby_player_only() {
        let mut world = floor_world();
        world.create_player_body(0, Vec3::new(0.0, STANDING_Y, 0.0));
        world.create_player_body(1, Vec3::new(30.0, STANDING_Y, 0.0));
        settle(&mut world, 2);

        let owners: Vec<BodyOwner> = world
            .query_sphere_overlap(vector![1.0, STANDING_Y, 0.0], 3.0)
            .into_iter()
            .map(|(_, owner)| owner)
            .collect();
        assert!(owners.contains(&BodyOwner::Player(0)));
        assert!(!owners.contains(&BodyOwner::Player(1)));
    }

    #[test]
    fn frozen_player_is_ignored_by_queries() {
        let mut world = floor_world();
        let shooter = world.create_player_body(0, Vec3::new(0.0, STANDING_Y, 5.0));
        let target = world.create_player_body(1, Vec3::new(0.0, STANDING_Y, -5.0));
        settle(&mut world, 2);

        world.set_body_active(target, false);
        settle(&mut world, 1);
        assert!(!world.is_body_active(target));

        let origin = world.body_position(shooter).unwrap();
        let hit = world.cast_ray(origin, vector![0.0, 0.0, -1.0], 50.0, true, Some(shooter));
        assert!(hit.map(|h| h.owner != BodyOwner::Player(1)).unwrap_or(true));
    }

    #[test]
    fn grenade_contact_with_floor_is_reported() {
        let mut world = floor_world();
        world.create_grenade_body(7, 0, vector![0.0, 0.5, 0.0], vector![0.0, -10.0, 0.0]);

        let mut contacts = Vec::new();
        for _ in 0..30 {
            contacts.extend(world.step());
        }
        assert!(contacts.contains(&GrenadeContact {
            grenade: 7,
            other: BodyOwner::World,
        }));
    }

    #[test]
    fn grenade_passes_through_its_thrower_only() {
        let mut world = floor_world();
        world.create_player_body(0, Vec3::new(0.0, STANDING_Y, 0.0));
        // Both spawned inside player 0's capsule
        world.create_grenade_body(1, 0, vector![0.0, 0.7, 0.0], Vector::zeros());
        world.create_grenade_body(2, 1, vector![0.0, 1.1, 0.0], Vector::zeros());

        let contacts = world.step();
        assert!(!contacts.contains(&GrenadeContact {
            grenade: 1,
            other: BodyOwner::Player(0),
        }));
        assert!(contacts.contains(&GrenadeContact {
            grenade: 2,
            other: BodyOwner::Player(0),
        }));
    }

    #[test]
    fn frozen_player_is_ignored_by_overlap() {
        let mut world = floor_world();
        let body = world.create_player_body(0, Vec3::new(0.0, STANDING_Y, 0.0));
        settle(&mut world, 2);
        world.set_body_active(body, false);

        let owners: Vec<BodyOwner> = world
            .query_sphere_overlap(vector![0.0, STANDING_Y, 0.0], 2.0)
            .into_iter()
            .map(|(_, owner)| owner)
            .collect();
        assert!(!owners.contains(&BodyOwner::Player(0)));
    }

    #[test]
    fn stuck_body_follows_repositioning() {
        let mut world = floor_world();
        let body = world.create_grenade_body(3, 0, vector![0.0, 2.0, 0.0], vector![0.0, -5.0, 0.0]);
        world.stick_body(body);
        settle(&mut world, 10);
        assert!((world.body_position(body).unwrap() - vector![0.0, 2.0, 0.0]).norm() < 1.0e-4);

        world.set_body_position(body, vector![4.0, 1.0, 0.0]);
        settle(&mut world, 1);
        assert_eq!(world.body_position(body).unwrap(), vector![4.0, 1.0, 0.0]);
    }

    #[test]
    fn removed_grenade_disappears() {
        let mut world = floor_world();
        let body = world.create_grenade_body(1, 0, vector![0.0, 2.0, 0.0], Vector::zeros());
        assert_eq!(world.body_count(), 1);
        world.remove_body(body);
        assert_eq!(world.body_count(), 0);
        assert!(world.body_position(body).is_none());
    }

    #[test]
    fn bundled_map_meshes_load() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("maps");
        let map = MapDefinition::load(&dir, "arena").unwrap();
        let mut world = PhysicsWorld::new();
        assert_eq!(world.load_map(&map).unwrap(), map.meshes.len());
    }

    #[test]
    fn empty_map_is_rejected() {
        let mut world = PhysicsWorld::new();
        assert!(world.load_map(&MapDefinition::fallback("x")).is_err());
    }
}
