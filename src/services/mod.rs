pub mod conversation_registry;
pub mod delivery_tracker;
pub mod gateway;
pub mod message_store;
pub mod moderation;
