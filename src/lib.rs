//! An asynchronous Byzantine fault tolerant atomic broadcast engine.
//!
//! A fixed committee of `N` processes, up to `f < N/3` of them faulty, builds a
//! shared DAG of signed units. Every honest process turns that DAG into the same
//! total order of units, one timing round at a time.
//!
//! ## How it works
//!
//! Each process keeps creating units on top of the units it has seen, picking
//! parents so that the DAG keeps climbing to higher levels. Units travel by
//! multicast, periodic gossip and on-demand fetches. When a process sees two
//! units of one creator sharing a predecessor, it multicasts a forking proof
//! reliably and from then on accepts that creator's units only when a quorum
//! commitment covers them. For every level a timing unit is chosen by a vote of
//! higher prime units, backed by a common coin, and everything below it that no
//! earlier round took is emitted in a deterministic order.
//!
//! The main entry point is [`service::ConsensusService`], which runs all of this
//! over any [`network::Network`]. The DAG and the ordering can also be driven by
//! hand through [`dag::Dag`], [`creator::new_unit`] and [`ordering::Ordering`].

pub mod adder;
pub mod alerter;
pub mod commitment;
pub mod compliance;
pub mod config;
pub mod creator;
pub mod crypto;
pub mod dag;
pub mod encoding;
pub mod error;
pub mod events;
pub mod extender;
pub mod fetch;
pub mod forking;
pub mod gossip;
pub mod multicast;
pub mod network;
pub mod ordering;
pub mod random;
pub mod rmc;
pub mod service;
pub mod syncer;
pub mod types;
pub mod unit;
pub mod utils;
