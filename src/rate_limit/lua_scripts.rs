/// Lua script for token bucket check-and-consume in Redis
///
/// Redis runs the whole script atomically, so read, refill and decrement
/// form one step for every instance sharing the server. The arithmetic
/// matches `BucketState::consume`.
///
/// KEYS[1] = bucket key
/// KEYS[2] = applied-request record key for this request id
/// ARGV[1] = capacity
/// ARGV[2] = refill rate (tokens per second)
/// ARGV[3] = current timestamp (unix milliseconds)
/// ARGV[4] = cost
/// ARGV[5] = window kind ("rolling" or "fixed")
/// ARGV[6] = request id
/// ARGV[7] = state time-to-live (milliseconds)
///
/// Every applied request leaves its own record at KEYS[2], written with
/// `SET NX PX`, so a retry finds its outcome even after other requests
/// have touched the bucket.
///
/// Returns: [allowed (0/1), remaining tokens (string), retry_after_ms]
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local record_key = KEYS[2]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local fixed = ARGV[5] == 'fixed'
local request_id = ARGV[6]
local ttl = tonumber(ARGV[7])
local epsilon = 1e-9

-- Replay of an already applied request
local record = redis.call('GET', record_key)
if record then
    local was_allowed, was_retry_ms, was_remaining = string.match(record, '^(%d+):(%d+):(.+)$')
    if was_allowed then
        return {tonumber(was_allowed), was_remaining, tonumber(was_retry_ms)}
    end
end

local state = redis.call('HMGET', key, 'tokens', 'ts', 'cap')

local tokens = tonumber(state[1])
local ts = tonumber(state[2])
local cap = tonumber(state[3])

-- Initialize if this is the first request
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
    cap = capacity
end

-- Policy capacity changed since the last write
if cap ~= capacity then
    tokens = math.min(tokens, capacity)
end

local elapsed = math.max(0, now - ts)
local period = capacity * 1000 / refill_rate

if fixed then
    if elapsed >= period then
        tokens = capacity
        ts = now
    end
else
    tokens = math.min(capacity, tokens + elapsed * refill_rate / 1000)
    ts = math.max(ts, now)
end

local allowed = 0
local retry_ms = 0

if tokens + epsilon >= cost then
    tokens = math.max(0, tokens - cost)
    allowed = 1
elseif fixed then
    retry_ms = math.max(1, math.ceil(period - elapsed))
else
    retry_ms = math.max(1, math.ceil((cost - tokens) * 1000 / refill_rate))
end

local remaining = tostring(tokens)

redis.call('HSET', key,
    'tokens', remaining,
    'ts', ts,
    'cap', capacity)
redis.call('PEXPIRE', key, ttl)
redis.call('SET', record_key, allowed .. ':' .. retry_ms .. ':' .. remaining, 'NX', 'PX', ttl)

return {allowed, remaining, retry_ms}
"#;
