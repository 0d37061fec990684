pub mod connection_service;
