pub mod api;
pub mod app_config;
pub mod backend_switch;
pub mod books_repository;
pub mod key_value_store;
pub mod shelves;
pub mod validation;
