//! Core types of the shadow page-table pool.
//!
//! This crate holds everything the pool shares with its environment:
//! address newtypes and arena indices, the [`PoolConfig`], the
//! [`PoolError`] type, the collaborator traits in [`driver`] and the
//! [`Rendezvous`] primitive used for the synchronized pool reset.

mod config;
mod core;
pub mod driver;
mod error;
mod rendezvous;
mod tracking;

pub use self::{
    config::PoolConfig,
    core::{
        AllocFlags, Gfn, Gpa, HostFrame, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, PhysExtIdx,
        PoolIdx, PoolInfo, UserIdx,
    },
    driver::{
        PoolAccessHandler, PoolBackend, PoolDriver, PoolGrow, PoolGuestRead, PoolPhysTracking,
        PoolTlb,
    },
    error::{PoolError, Resource},
    rendezvous::Rendezvous,
    tracking::{PhysRef, PhysTracking},
};
