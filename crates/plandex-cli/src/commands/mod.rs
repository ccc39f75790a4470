pub(crate) mod changes;
pub(crate) mod context;
pub(crate) mod history;
pub(crate) mod plans;
pub(crate) mod settings;
pub(crate) mod turn;
