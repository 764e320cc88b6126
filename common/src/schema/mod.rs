mod cart;
mod manual_payment;
mod pending_transaction;
mod product;
mod sale;
mod status;

pub use cart::*;
pub use manual_payment::*;
pub use pending_transaction::*;
pub use product::*;
pub use sale::*;
pub use status::*;
