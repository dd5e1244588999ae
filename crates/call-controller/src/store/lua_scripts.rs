//! Lua scripts for atomic shared-store operations.
//!
//! Each script is one atomic claim: racing processes observe exactly one
//! winner. The queue scripts keep three structures consistent (ordered
//! set, payload keys, request-id index); the lease scripts gate mutation
//! on current ownership; the call-end script performs the single allowed
//! terminal transition.
//!
//! None of the scripts rewrites stored JSON: chat-platform snowflake ids
//! exceed Lua's 53-bit number precision, so payloads and call records are
//! opaque strings here. The only JSON field a script reads is the request
//! `id` (a UUID string), which round-trips safely through cjson.

/// Atomically enqueue a request.
///
/// Keys:
/// - KEYS[1]: ordered queue (ZSET)
/// - KEYS[2]: payload key for the channel
/// - KEYS[3]: request-id index (HASH)
///
/// Args:
/// - ARGV[1]: channel id
/// - ARGV[2]: score
/// - ARGV[3]: payload JSON
/// - ARGV[4]: request id
/// - ARGV[5]: payload TTL in milliseconds
/// - ARGV[6]: queue capacity
///
/// Returns:
/// - 1: queued
/// - 0: channel already queued
/// - -1: queue full
pub const ENQUEUE: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) or redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[6]) then
    return -1
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('SET', KEYS[2], ARGV[3], 'PX', tonumber(ARGV[5]))
redis.call('HSET', KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

/// Atomically dequeue a request by id (the claim primitive).
///
/// Keys:
/// - KEYS[1]: ordered queue (ZSET)
/// - KEYS[2]: request-id index (HASH)
///
/// Args:
/// - ARGV[1]: request id
/// - ARGV[2]: payload key prefix
///
/// Returns:
/// - 1: this caller removed the request
/// - 0: request no longer queued
pub const DEQUEUE: &str = r#"
local channel = redis.call('HGET', KEYS[2], ARGV[1])
if not channel then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
local removed = redis.call('ZREM', KEYS[1], channel)
redis.call('DEL', ARGV[2] .. channel)
return removed
"#;

/// Atomically dequeue a channel's request (cancellation path).
///
/// Keys:
/// - KEYS[1]: ordered queue (ZSET)
/// - KEYS[2]: request-id index (HASH)
/// - KEYS[3]: payload key for the channel
///
/// Args:
/// - ARGV[1]: channel id
///
/// Returns:
/// - 1: this caller removed the request
/// - 0: request no longer queued
pub const DEQUEUE_CHANNEL: &str = r#"
local payload = redis.call('GET', KEYS[3])
if payload then
    local ok, req = pcall(cjson.decode, payload)
    if ok and type(req) == 'table' and req.id then
        redis.call('HDEL', KEYS[2], req.id)
    end
end
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[3])
return removed
"#;

/// Remove timed-out entries and reconcile orphaned index entries.
///
/// Keys:
/// - KEYS[1]: ordered queue (ZSET)
/// - KEYS[2]: request-id index (HASH)
///
/// Args:
/// - ARGV[1]: cutoff score (entries below are expired)
/// - ARGV[2]: payload key prefix
///
/// Returns the number of queue entries removed.
pub const QUEUE_CLEANUP: &str = r#"
local removed = 0
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, channel in ipairs(expired) do
    redis.call('ZREM', KEYS[1], channel)
    redis.call('DEL', ARGV[2] .. channel)
    removed = removed + 1
end
local members = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, channel in ipairs(members) do
    if redis.call('EXISTS', ARGV[2] .. channel) == 0 then
        redis.call('ZREM', KEYS[1], channel)
        removed = removed + 1
    end
end
local ids = redis.call('HGETALL', KEYS[2])
for i = 1, #ids, 2 do
    if not redis.call('ZSCORE', KEYS[1], ids[i + 1]) then
        redis.call('HDEL', KEYS[2], ids[i])
    end
end
return removed
"#;

/// Renew the lease if the caller still owns it.
///
/// Keys:
/// - KEYS[1]: lease key
///
/// Args:
/// - ARGV[1]: owner id
/// - ARGV[2]: lease TTL in milliseconds
///
/// Returns:
/// - 1: renewed
/// - 0: lease lost (expired or taken by another owner)
pub const LEASE_RENEW: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]))
    return 1
end
return 0
"#;

/// Release the lease if the caller owns it.
///
/// Keys:
/// - KEYS[1]: lease key
///
/// Args:
/// - ARGV[1]: owner id
///
/// Returns:
/// - 1: released
/// - 0: not the owner, nothing done
pub const LEASE_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// Create a call: record, status, active index, both channel mappings.
///
/// Keys:
/// - KEYS[1]: call record key
/// - KEYS[2]: call status key
/// - KEYS[3]: active call index (SET)
///
/// Args:
/// - ARGV[1]: call id
/// - ARGV[2]: record JSON
/// - ARGV[3]: by-channel key prefix
/// - ARGV[4]: channel A
/// - ARGV[5]: channel B
pub const CALL_CREATE: &str = r#"
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SET', KEYS[2], 'active')
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('SET', ARGV[3] .. ARGV[4], ARGV[1])
redis.call('SET', ARGV[3] .. ARGV[5], ARGV[1])
return 1
"#;

/// Atomically transition a call from active to ended.
///
/// Releases the channel mappings (only if they still point at this call)
/// and puts the call's keys on a grace TTL so the finalizer can assemble
/// the ended record before they evaporate.
///
/// Keys:
/// - KEYS[1]: call status key
/// - KEYS[2]: call end-info key (HASH)
/// - KEYS[3]: active call index (SET)
/// - KEYS[4]: call record key
///
/// Args:
/// - ARGV[1]: call id
/// - ARGV[2]: ended_at in epoch milliseconds
/// - ARGV[3]: end reason
/// - ARGV[4]: flagged ("1"/"0")
/// - ARGV[5]: grace TTL in milliseconds
/// - ARGV[6]: by-channel key prefix
/// - ARGV[7]: call key prefix (for users/messages/counts)
/// - ARGV[8]: channel A
/// - ARGV[9]: channel B
///
/// Returns:
/// - 1: this caller ended the call
/// - 0: call already ended or unknown
pub const CALL_END: &str = r#"
if redis.call('GET', KEYS[1]) ~= 'active' then
    return 0
end
redis.call('SET', KEYS[1], 'ended')
redis.call('HSET', KEYS[2], 'ended_at', ARGV[2], 'reason', ARGV[3], 'flagged', ARGV[4])
redis.call('SREM', KEYS[3], ARGV[1])
for i = 8, 9 do
    local mapped = redis.call('GET', ARGV[6] .. ARGV[i])
    if mapped == ARGV[1] then
        redis.call('DEL', ARGV[6] .. ARGV[i])
    end
end
local grace = tonumber(ARGV[5])
redis.call('PEXPIRE', KEYS[1], grace)
redis.call('PEXPIRE', KEYS[2], grace)
redis.call('PEXPIRE', KEYS[4], grace)
redis.call('PEXPIRE', ARGV[7] .. ':messages', grace)
redis.call('PEXPIRE', ARGV[7] .. ':counts', grace)
redis.call('PEXPIRE', ARGV[7] .. ':users:' .. ARGV[8], grace)
redis.call('PEXPIRE', ARGV[7] .. ':users:' .. ARGV[9], grace)
return 1
"#;

/// Append a message and bump the side's relayed-message count.
///
/// Keys:
/// - KEYS[1]: message list (LIST)
/// - KEYS[2]: count hash (HASH)
///
/// Args:
/// - ARGV[1]: message JSON
/// - ARGV[2]: channel id
///
/// Returns the side's new message count.
pub const MESSAGE_PUSH: &str = r#"
redis.call('RPUSH', KEYS[1], ARGV[1])
return redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
"#;
