//! Internal prelude for commonly used crate utilities.

pub(crate) use crate::observability::{
    log_debug as debug, log_error as error, log_info as info, log_trace as trace,
    log_warn as warn,
};
