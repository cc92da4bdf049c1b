//! Tiered persistence: a schema-generic pager over SQLite plus a small
//! key/value cache for coordination state.

mod cond;
mod kv;
mod pager;

pub use cond::{cond, Cond};
pub use kv::KvStore;
pub use pager::{
    Agg, AggField, Granularity, GroupRow, PageCache, Pager, Record, Sorter, Store, TimeBucket,
};
