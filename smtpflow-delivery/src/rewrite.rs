//! Open and click tracking for HTML bodies.
//!
//! Absolute `http(s)` anchors are pointed at the click redirector and a 1x1
//! pixel is placed before `</body>`. The rewrite is streaming (`lol_html`)
//! and any failure yields the input untouched: tracking never blocks a send.

use std::cell::Cell;

use lol_html::{RewriteStrSettings, element, errors::RewritingError, html_content::ContentType};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use smtpflow_common::{internal, tracking::TrackingId};

/// The characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Rewrite `html` for `tracking_id`, with trackers served from `base_url`.
#[must_use]
pub fn rewrite(html: &str, tracking_id: &TrackingId, base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');

    match try_rewrite(html, tracking_id, base_url) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            internal!(level = DEBUG, "Unable to rewrite html for {tracking_id}: {err}");
            html.to_owned()
        }
    }
}

/// The redirector URL for one link.
#[must_use]
pub fn click_url(base_url: &str, tracking_id: &TrackingId, target: &str) -> String {
    format!(
        "{}/t/click/{tracking_id}?url={}",
        base_url.trim_end_matches('/'),
        utf8_percent_encode(target, URI_COMPONENT)
    )
}

#[must_use]
pub fn pixel_tag(base_url: &str, tracking_id: &TrackingId) -> String {
    format!(
        r#"<img src="{}/t/open/{tracking_id}" width="1" height="1" style="display:none;visibility:hidden;opacity:0;" alt="" />"#,
        base_url.trim_end_matches('/')
    )
}

fn try_rewrite(
    html: &str,
    tracking_id: &TrackingId,
    base_url: &str,
) -> Result<String, RewritingError> {
    let pixel = pixel_tag(base_url, tracking_id);
    let pixel_placed = Cell::new(false);

    let mut rewritten = lol_html::rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("a[href]", |el| {
                    if let Some(href) = el.get_attribute("href")
                        && is_absolute_http(&href)
                    {
                        let target = unescape_ampersands(href.trim());
                        el.set_attribute("href", &click_url(base_url, tracking_id, &target))?;
                    }
                    Ok(())
                }),
                element!("body", |el| {
                    if !pixel_placed.replace(true) {
                        el.append(&pixel, ContentType::Html);
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )?;

    // No closing body tag to hang the pixel on
    if !rewritten.contains(&pixel) {
        rewritten.push_str(&pixel);
    }

    Ok(rewritten)
}

fn is_absolute_http(href: &str) -> bool {
    let href = href.trim_start().as_bytes();
    let starts_with = |prefix: &[u8]| {
        href.len() >= prefix.len() && href[..prefix.len()].eq_ignore_ascii_case(prefix)
    };

    starts_with(b"http://") || starts_with(b"https://")
}

/// Attribute values come back raw, so query strings still carry `&amp;`.
fn unescape_ampersands(href: &str) -> String {
    href.replace("&amp;", "&")
}
