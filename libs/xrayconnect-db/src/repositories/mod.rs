pub mod connection_repo;
pub mod server_repo;
pub mod user_repo;

pub use connection_repo::ConnectionRepository;
pub use server_repo::ServerRepository;
pub use user_repo::UserRepository;
