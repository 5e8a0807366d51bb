//! Airhost - Guest Messaging Backend
//!
//! A Rust library for the messaging side of a short-term rental host platform:
//! WhatsApp conversations with guests, urgency tagging and welcome templates.
//!
//! # Features
//!
//! - WhatsApp Cloud API webhook ingestion with redelivery dedup
//! - Keyword and model-backed urgency classification
//! - Conversation creation with an optional welcome template
//! - SQLite or Supabase storage behind one trait
//! - Transcript export (TXT, CSV, JSON)

/// Reply drafting for hosts
pub mod assistant;
/// WhatsApp delivery dedup cache
pub mod cache;
/// Urgency classification
pub mod classifier;
/// Configuration management
pub mod config;
/// Database operations and connection pooling
pub mod db;
/// Error types
pub mod error;
/// Transcript export
pub mod file_writer;
/// Legacy settings import
pub mod import;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// OpenAI chat completions client
pub mod openai;
/// Phone number normalization
pub mod phone;
/// Repository pattern for data access
pub mod repository;
/// Database schema definitions
pub mod schema;
/// HTTP server
pub mod server;
/// Messaging workflows
pub mod service;
/// Supabase PostgREST store
pub mod supabase;
/// Input validation and sanitization
pub mod validation;
/// WhatsApp Cloud API
pub mod whatsapp;

// Re-export key components for easier access
pub use classifier::{Classifier, KeywordClassifier, LlmClassifier};
pub use db::Database;
pub use error::{AirhostError, Result};
pub use models::{Classification, Conversation, ConversationTag, Message, OutputFormat};
pub use repository::{ConversationStore, SqliteStore};
pub use service::ConversationService;
