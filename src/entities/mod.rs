//! Database entities for the checkout core

pub mod cart;
pub mod cart_item;
pub mod class_program;
pub mod coupon;
pub mod enrollment;
pub mod media_file;
pub mod order;
pub mod order_coupon;
pub mod order_item;
pub mod package;
pub mod product;
pub mod profile;
pub mod program_member;
pub mod program_session;
pub mod transaction;
