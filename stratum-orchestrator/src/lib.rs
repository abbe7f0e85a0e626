pub mod bootstrap;
pub mod cli;
pub mod configuration;
pub mod executor;
pub mod health_check;
pub mod logger;
pub mod manifest;
pub mod planner;
pub mod provider_manager;
pub mod renderer;
pub mod services;
pub mod settings;
pub mod state_machine;
