pub(crate) use alloc::{
    collections::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::fmt::Debug;

pub(crate) use log::{debug, error, info};
pub(crate) use spin::RwLock;

pub(crate) use crate::error::{Error, Result};
pub(crate) use crate::traits::{Bid, BlockDevice, BLOCK_SIZE};
pub(crate) use crate::utils::Dirty;
