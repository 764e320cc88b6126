mod db;
mod error;
mod helpers;
pub mod mpesa;
pub mod poller;
mod schema;

pub use db::*;
pub use error::*;
pub use helpers::*;
pub use schema::*;
