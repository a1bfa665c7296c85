//! notifyd: fan out application events to chat and mail subscribers through a
//! durable notification queue.
//!
//! Callers enqueue through [`notify::notify`] (or the block-based
//! [`notify::notify_block`]); the [`dispatch::Dispatcher`] polls the queue and
//! delivers through the channel adapters in [`chat`] and [`mail`].

pub mod blocks;
pub mod chat;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod http;
pub mod mail;
pub mod model;
pub mod notify;
pub mod resolver;
pub mod template;
