/// Model repositories.
mod local;
pub use local::LocalRepo;

mod repo;
pub use repo::Repo;
