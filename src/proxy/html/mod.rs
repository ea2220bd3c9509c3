//! Streaming HTML link rewriting
//!
//! Split in two: a push [`Tokenizer`](tokenizer::Tokenizer) turning bytes
//! into a closed set of token variants, and a [`HtmlRewriter`](rewrite::HtmlRewriter)
//! consuming those tokens, rewriting URL-bearing attributes, and serializing
//! markup back out. [`HtmlRewriteStream`](rewrite::HtmlRewriteStream) wires
//! the pair into the response body pipeline.

pub mod rewrite;
pub mod tokenizer;

pub use rewrite::{should_rewrite, HtmlRewriteStream, HtmlRewriter};
pub use tokenizer::{Token, TokenizeError, Tokenizer, MAX_TOKEN_BYTES};
