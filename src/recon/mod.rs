pub mod anomaly;
pub mod archive_list;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod events;
pub mod inventory;
pub mod journal;
pub mod lock;
pub mod model;
pub mod notify;
pub mod paths;
pub mod prefetch;
pub mod reconciler;
pub mod results;
pub mod retry;
pub mod run;
pub mod util;
