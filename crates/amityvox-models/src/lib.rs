pub mod channel;
pub mod gateway;
pub mod guild;
pub mod instance;
pub mod invite;
pub mod member;
pub mod message;
pub mod peer;
pub mod permissions;
pub mod presence;
pub mod user;
