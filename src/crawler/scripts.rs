//! Page-side extraction for the platform's web client. Each script returns
//! JSON that the crawler decodes with serde; selectors live only here.

pub const SERVER_LIST_READY: &str = r#"div[data-list-item-id^="guildsnav___"]"#;
pub const CHANNEL_LIST_READY: &str = "#channels";
pub const MESSAGE_LIST_READY: &str = r#"main[class*="chatContent"]"#;
pub const COMPOSER: &str = r#"div[role="textbox"][data-slate-editor="true"]"#;

/// `[{ id, name }]` for every server icon in the guild bar.
pub const SERVERS: &str = r#"
const servers = [];
const seen = new Set();
for (const item of document.querySelectorAll('div[role="treeitem"][data-list-item-id^="guildsnav___"]')) {
    const id = (item.getAttribute('data-list-item-id') || '').split('___')[1];
    if (!id || !/^\d+$/.test(id) || seen.has(id)) continue;
    seen.add(id);
    const container = item.closest('[data-dnd-name]');
    const name = (container && container.getAttribute('data-dnd-name')) || item.getAttribute('aria-label') || '';
    servers.push({ id: id, name: name.trim() });
}
return servers;
"#;

/// `[{ id, name }]` for channel links currently rendered in the sidebar.
/// `arguments[0]`: server id.
pub const CHANNELS: &str = r#"
const serverId = arguments[0];
const channels = [];
for (const link of document.querySelectorAll('#channels li a[href*="/channels/' + serverId + '/"]')) {
    const id = (link.getAttribute('href') || '').split('/').pop();
    if (!id) continue;
    const label = link.querySelector('[class*="name"]') || link;
    channels.push({ id: id, name: (label.textContent || '').trim() });
}
return channels;
"#;

/// Scrolls the channel sidebar. `arguments[0]`: target offset, `null` for top.
/// Returns `{ position, height, viewport }` or `null` without a sidebar.
pub const SCROLL_CHANNELS: &str = r#"
const el = document.querySelector('#channels');
if (!el) return null;
const target = arguments[0] === null ? 0 : Math.min(arguments[0], el.scrollHeight);
el.scrollTo({ top: target });
return { position: target, height: el.scrollHeight, viewport: el.offsetHeight };
"#;

/// Rendered messages of the open channel in DOM (chronological) order.
/// Grouped continuations carry no header, so `author` is `null` for them.
/// `arguments[0]`: channel id.
pub const MESSAGES: &str = r#"
const prefix = 'chat-messages-' + arguments[0] + '-';
const messages = [];
for (const li of document.querySelectorAll('main li[id^="' + prefix + '"]')) {
    const id = li.id.slice(prefix.length);
    const header = li.querySelector('#message-username-' + id);
    let author = null;
    let authorId = null;
    if (header) {
        author = (header.textContent || '').trim();
        const avatar = li.querySelector('img[src*="/avatars/"]');
        const match = avatar && (avatar.getAttribute('src') || '').match(/\/avatars\/(\d+)\//);
        authorId = match ? match[1] : null;
    }
    const time = li.querySelector('#message-timestamp-' + id);
    const content = li.querySelector('#message-content-' + id);
    const reply = li.querySelector('[id^="message-reply-context-"] [id^="message-content-"]');
    messages.push({
        id: id,
        author: author,
        author_id: authorId,
        content: content ? content.textContent : '',
        timestamp: time ? time.getAttribute('datetime') : null,
        reply_to_id: reply ? reply.id.replace('message-content-', '') : null,
        is_bot: !!li.querySelector('[class*="botTag"]') || /systemMessage/.test(li.className),
    });
}
return messages;
"#;

/// Scrolls the message pane. `arguments[0]`: `"top"` loads older history,
/// `"bottom"` jumps to the newest. Returns `false` without a pane.
pub const SCROLL_MESSAGES: &str = r#"
const scroller = document.querySelector('main[class*="chatContent"] div[class*="scroller"][data-jump-section="global"]');
if (!scroller) return false;
scroller.scrollTo({ top: arguments[0] === 'bottom' ? scroller.scrollHeight : 0 });
return true;
"#;
