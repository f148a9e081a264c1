pub mod blob;
pub mod changelog;
pub mod mail;
pub mod notifier;
pub mod submitter;
