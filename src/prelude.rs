// SPDX-License-Identifier: MPL-2.0

#![allow(unused_imports)]

pub(crate) use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::{fmt::Debug, time::Duration};

pub(crate) use log::{debug, warn};
pub(crate) use spin::RwLock;
pub(crate) use static_assertions::const_assert;

pub(crate) use crate::{
    error::{Error, Result},
    traits::{BlockDevice, BlockDeviceExt, Ext2Bid, BLOCK_SIZE},
    utils::Dirty,
};
