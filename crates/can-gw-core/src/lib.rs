pub mod capture;
pub mod direction;
pub mod error;
pub mod events;
pub mod facade;
pub mod frame;
pub mod interfaces;
pub mod link;
pub mod manipulation;
pub mod scheduler;

pub use capture::{CaptureSession, ConfigSnapshot};
pub use direction::{Direction, DirectionState, LatencyStats, RuleDirection};
pub use error::{GatewayError, OpenKind, Result};
pub use events::{EventBus, GatewayEvent};
pub use facade::{Gateway, GatewayConfig, GatewayStats};
pub use frame::{Frame, MAX_PAYLOAD_LEN};
pub use interfaces::{InterfaceController, InterfaceState, LinkState, NullInterfaceController, ShellInterfaceController};
pub use link::{CanLink, CanLinkFactory, MockCanLink, MockCanLinkFactory, SocketCanLink, SocketCanLinkFactory};
pub use manipulation::{Action, ByteOp, ByteOpKind, ManipulationEngine, ManipulationRule};
pub use scheduler::{GatewayCore, Settings, SettingsValues};
