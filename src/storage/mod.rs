mod db;

pub use db::{Database, MessageQuery};
