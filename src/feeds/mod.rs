pub mod analytics;
pub mod book;
pub mod copyflow;
pub mod derivs;
pub mod oracle;
pub mod price;
