pub mod background;
pub mod controller;
pub mod detector;
pub mod enhancement;
pub mod mock;
pub mod pipeline;
pub mod quality;
pub mod queue;
pub mod resources;
pub mod scoring;
pub mod security;
pub mod stages;
pub mod validator;
