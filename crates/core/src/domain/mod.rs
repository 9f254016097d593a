pub mod actor;
pub mod customer;
pub mod quote;
pub mod request;
pub mod review;
pub mod shop;
