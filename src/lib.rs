pub mod calendar;
pub mod clock;
pub mod collab;
pub mod config;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod queue;
pub mod reminder;
pub mod service;
pub mod worker;
