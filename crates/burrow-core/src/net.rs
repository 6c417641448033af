use std::{collections::HashMap, net::IpAddr};

/// Lower-cased header name -> value, as produced by [`crate::http::parse_headers`].
pub type Headers = HashMap<String, String>;

/// Resolves the IP an external caller should be attributed to: the first
/// `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
/// Header values that do not parse as an IP are skipped.
pub fn caller_ip(headers: &Headers, peer: Option<IpAddr>) -> Option<IpAddr> {
	if let Some(forwarded) = headers.get("x-forwarded-for")
		&& let Some(first) = forwarded.split(',').next()
		&& let Ok(ip) = first.trim().parse()
	{
		return Some(ip);
	}
	if let Some(real) = headers.get("x-real-ip")
		&& let Ok(ip) = real.trim().parse()
	{
		return Some(ip);
	}
	peer
}
