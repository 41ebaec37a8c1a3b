//! Ingestion: advertisement decoding and range smoothing.

mod advert;
mod filter;

pub use advert::{
    parse_ltvs, AdvertisementDecoder, DecodedAdvertisement, RangeSample, Rgb, INVALID_RANGE_CM,
    LTV_TYPE_MANUFACTURER, VENDOR_SIGNATURE,
};
pub use filter::{RangeFilter, DEFAULT_WINDOW};
