//! Per-peer session coordination: pause gate, clocks, scheduling, world merge
//! and outbound batching, tied together by [`SessionEngine`]

pub mod clock;
pub mod engine;
pub mod entity;
pub mod interaction;
pub mod pause;
pub mod runner;
pub mod scheduler;
pub mod snapshot;

pub use clock::{ClockEstimate, ClockSynchronizer, MatchClock};
pub use engine::{
    EntityIntegrator, FrameReport, LocalSimulation, ModalQuery, NoModal, SessionEngine, SessionStats,
    SessionView, StepContext,
};
pub use entity::{EntityBody, EntityOrigin, LocalStatus, RenderTrail, SimEntity, Vec2};
pub use interaction::{InteractionBatcher, LocalVitals, VitalsReporter};
pub use pause::{PauseCoordinator, PauseOutcome, PauseStats, PauseTokenStore, PauseTransition, TokenMinter};
pub use runner::{SessionCommand, SessionHandle, SessionRunner};
pub use scheduler::{SchedulerState, SimulationScheduler, TickPlan};
pub use snapshot::{ApplyReport, DeathOutcome, EntityArena, SnapshotReconciler};
