pub mod entities;
pub mod events;
pub mod repository;
pub mod services;
pub mod value_objects;
