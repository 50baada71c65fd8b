//! Protocol tests against mock backends.

mod support;
