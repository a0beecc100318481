pub mod info;

pub use info::{
    CacheLevel, CatInfo, CatInfoAll, L3MonInfo, MbInfo, ResctrlInfo, MBPS_MOUNT_OPTION,
    MOUNTS_PATH,
};
