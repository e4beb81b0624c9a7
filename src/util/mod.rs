pub mod constants;
pub mod urls;

pub use constants::*;
pub use urls::{
    is_crawlable_url, normalize_page_url, page_output_path, parse_redirects_csv, same_origin,
};
