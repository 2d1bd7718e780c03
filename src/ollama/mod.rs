//! Ollama LLM integration module
//!
//! This module provides a chat client for Ollama's `/api/chat` endpoint with
//! tool calling and streamed partial content.

pub mod client;
pub mod tool_use;

pub use client::ChatClient;

/// Where a local Ollama server listens by default
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
