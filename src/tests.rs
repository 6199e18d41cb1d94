use super::*;

mod bus_registry;
mod content_cache;
mod document_classification;
mod event_loop_queue;
mod function_bindings;
mod html_parser;
mod location_parts;
mod plugin_chain;
mod selector_engine;
mod style_rules;
mod template_parser;
