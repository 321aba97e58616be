//! Built-in CIDR seeds.
//!
//! The china list is only a starter set of large, long-lived delegations; the
//! periodic refresher replaces it with the full APNIC data soon after start.

pub(crate) const PRIVATE: [&str; 17] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
    "2001:db8::/32",
];

pub(crate) const CHINA: [&str; 39] = [
    "1.2.4.0/24",
    "1.24.0.0/13",
    "14.16.0.0/12",
    "27.8.0.0/13",
    "36.96.0.0/11",
    "39.64.0.0/11",
    "42.48.0.0/13",
    "58.16.0.0/13",
    "58.192.0.0/11",
    "59.32.0.0/13",
    "60.160.0.0/11",
    "61.128.0.0/10",
    "101.16.0.0/12",
    "106.80.0.0/12",
    "110.16.0.0/12",
    "111.0.0.0/10",
    "112.0.0.0/10",
    "113.64.0.0/10",
    "114.80.0.0/12",
    "115.48.0.0/12",
    "116.112.0.0/12",
    "117.32.0.0/13",
    "119.0.0.0/13",
    "120.64.0.0/10",
    "121.16.0.0/12",
    "123.112.0.0/12",
    "124.64.0.0/15",
    "125.64.0.0/11",
    "180.96.0.0/13",
    "182.32.0.0/12",
    "183.0.0.0/10",
    "202.96.0.0/12",
    "218.0.0.0/11",
    "219.128.0.0/11",
    "220.160.0.0/11",
    "221.0.0.0/13",
    "2408:8000::/20",
    "2409:8000::/20",
    "240e::/20",
];
