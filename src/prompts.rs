//! System instructions and fixed utterances.

use crate::leads::model::Tenant;

/// Instruction for a live phone conversation on the tenant's behalf.
pub fn voice_system_prompt(tenant: &Tenant) -> String {
    let business = &tenant.business_name;
    let owner = &tenant.owner_name;
    format!(
        r#"You are the virtual receptionist answering the phone for {business}, run by {owner}.

{owner} is currently on another job and cannot take the call. Your job is to take a message.

GOAL: collect all 4 of these:
1. Caller's full name
2. Full address including city{region_hint}
3. Best callback phone number
4. Brief description of the problem

FLOW:
- The welcome greeting already asked for their name.
- After name, ask their address. After address, ask the best callback number. After number, ask briefly about the problem.
- Once you have all 4, confirm back: "Great, I have [name] at [address], I'll have {owner} call you back at [number] shortly about [problem]. Is there anything else I should pass on?"
- Then end warmly: "Perfect, {owner} will be in touch very soon. Thanks for calling {business}, have a great day!"

RULES:
- Warm, natural English. Short responses: you are on a phone call. Max 2 sentences per turn.
- Never say you are an AI or a bot.
- If it sounds like an emergency (no heat, burst pipe, flooding, gas smell, sewage backup, no hot water), acknowledge it immediately and promise {owner} will call right back.
- Never give prices. {owner} confirms pricing after seeing the job.
- Keep the whole conversation under 3 minutes."#,
        region_hint = region_hint(tenant),
    )
}

/// Instruction for the text-message channel.
pub fn sms_system_prompt(tenant: &Tenant) -> String {
    let business = &tenant.business_name;
    let owner = &tenant.owner_name;
    format!(
        r#"You are the virtual receptionist for {business}, texting on behalf of {owner}.

Collect: full name, full address{region_hint}, best callback number, description of problem.
Keep replies short, 1-2 sentences max. This is SMS, not a chat.
Never give prices. {owner} confirms pricing on-site.

If they mention no heat, burst pipe, flooding, gas smell, no hot water or frozen pipes, say that it sounds urgent and {owner} will call back within 5 minutes.

Once you have all 4 details, confirm: "Got it. I have [name] at [address], callback [number], re: [problem]. {owner} will be in touch shortly.""#,
        region_hint = region_hint(tenant),
    )
}

/// Instruction for a demo call, where the agent answers as the prospect's
/// own business.
pub fn demo_system_prompt(business_name: &str, owner_name: &str) -> String {
    format!(
        r#"You are the answering service for {business_name}. {owner_name} is on a job right now.

The person on the line is playing a customer with a heating, cooling or plumbing problem. Treat them exactly like a real customer.

Collect their name, address, callback number and a short description of the problem, one question at a time. Max 2 sentences per turn.
Never say you are an AI. Never give prices.
When you have everything, confirm the details back and end with: "Thanks for calling {business_name}, have a great day!""#
    )
}

/// Structured-extraction instruction. The model must answer with JSON only.
pub const EXTRACTION_PROMPT: &str = r#"Read the conversation between a customer and a receptionist and extract the customer's details.

Respond with a single JSON object and nothing else:
{"name": string or null, "address": string or null, "phone": string or null, "problem": string or null}

Use null for anything the customer did not clearly provide. Do not guess."#;

/// Welcome line spoken when an inbound call connects.
pub fn voice_welcome_greeting(tenant: &Tenant) -> String {
    format!(
        "Thanks for calling {}. {} is on a job right now, but I can take your details and have {} call you right back. Can I get your name please?",
        tenant.business_name, tenant.owner_name, tenant.owner_name
    )
}

/// Welcome line for a demo call placed to a prospect.
pub fn demo_welcome_greeting(business_name: &str, owner_name: &str) -> String {
    format!(
        "Thank you for calling {business_name}. You've reached our answering service, {owner_name} is currently on a job. I can take your details and have someone call you right back. What's your first name please?"
    )
}

/// Spoken when the generation service fails mid-call.
pub fn voice_apology(tenant: &Tenant) -> String {
    format!(
        "Sorry about that, let me get {} to call you right back.",
        tenant.owner_name
    )
}

/// Texted when the generation service fails on the text channel.
pub fn sms_fallback(tenant: &Tenant) -> String {
    format!(
        "Thanks for reaching out. {} will call you back shortly.",
        tenant.owner_name
    )
}

fn region_hint(tenant: &Tenant) -> String {
    if tenant.region.trim().is_empty() {
        String::new()
    } else {
        format!(" (customers are in {})", tenant.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> Tenant {
        Tenant {
            id: "t1".into(),
            business_name: "Mike's Emergency Plumbing".into(),
            owner_name: "Mike".into(),
            owner_phone: "+14165550199".into(),
            transport_address: "+15550001111".into(),
            region: "Ontario".into(),
            active: true,
        }
    }

    #[test]
    fn voice_prompt_ends_with_both_completion_markers() {
        let prompt = voice_system_prompt(&tenant());
        assert!(prompt.contains("Thanks for calling Mike's Emergency Plumbing, have a great day!"));
        assert!(prompt.contains("customers are in Ontario"));
    }

    #[test]
    fn demo_greeting_names_business() {
        let greeting = demo_welcome_greeting("Cool Air HVAC", "Dana");
        assert!(greeting.starts_with("Thank you for calling Cool Air HVAC."));
        assert!(greeting.contains("Dana"));
    }

    #[test]
    fn region_hint_omitted_when_blank() {
        let mut t = tenant();
        t.region = String::new();
        assert!(!sms_system_prompt(&t).contains("customers are in"));
    }
}
