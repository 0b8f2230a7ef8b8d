pub mod control_plane;
pub mod http_client;

pub use control_plane::{ControlPlane, ControlPlaneError};
pub use http_client::{HttpClient, HttpClientError};
