pub mod camera;
pub mod session;
