//! Outbound campaign message copy.

use crate::nurture::model::Prospect;

/// Renders campaign messages for one region and set of links.
#[derive(Debug, Clone)]
pub struct Templates {
    region: String,
    trial_link: String,
    payment_link: String,
}

impl Templates {
    pub fn new(
        region: impl Into<String>,
        trial_link: impl Into<String>,
        payment_link: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            trial_link: trial_link.into(),
            payment_link: payment_link.into(),
        }
    }

    pub fn initial(&self, p: &Prospect) -> String {
        format!(
            "Hi {owner}, quick question: how many calls does {business} miss every week?\n\n\
             Every missed call goes straight to your competitor.\n\n\
             We built an AI that only kicks in when you don't answer. It captures the lead and texts you instantly.\n\n\
             Your competitors in {region} are already using it.\n\n\
             Want to hear it answer as {business} right now? Reply YES",
            owner = p.salutation(),
            business = p.business_name,
            region = self.region,
        )
    }

    /// Follow-up number `n` (1-based). Anything past the first is the last.
    pub fn follow_up(&self, p: &Prospect, n: u32) -> String {
        if n <= 1 {
            format!(
                "Hi {owner}, still thinking about it?\n\n\
                 Last week alone, contractors in {region} lost an average of 8 calls to voicemail.\n\n\
                 Each one is a lead your competitor picked up.\n\n\
                 Takes 2 minutes to hear how it works. Reply YES and we'll demo it as {business} right now.",
                owner = p.salutation(),
                business = p.business_name,
                region = self.region,
            )
        } else {
            format!(
                "Last message from us, {owner}.\n\n\
                 If missed calls aren't a problem for {business}, no worries at all.\n\n\
                 But if you're losing even 2-3 leads a week, that's thousands a month walking out the door.\n\n\
                 Reply YES for a 2-minute live demo. No commitment, no card needed.",
                owner = p.salutation(),
                business = p.business_name,
            )
        }
    }

    pub fn yes_received(&self, p: &Prospect) -> String {
        format!(
            "Perfect! Calling {business} right now.\n\n\
             Answer and pretend you're a customer calling in with a problem. \
             You'll hear exactly what your customers would hear.",
            business = p.business_name,
        )
    }

    pub fn no_answer_retry(&self, p: &Prospect) -> String {
        format!(
            "Hi {owner}, we tried calling but you must be on a job.\n\n\
             Reply YES again when you have 2 minutes and we'll call right back.",
            owner = p.salutation(),
        )
    }

    pub fn after_demo(&self, p: &Prospect) -> String {
        format!(
            "That's what your customers hear when they can't reach you, \
             instead of going to voicemail and calling your competitor.\n\n\
             Start your 7-day free trial, no card needed:\n\
             Reply TRIAL or visit: {link}",
            link = self.trial_link_for(p),
        )
    }

    pub fn trial_started(&self, p: &Prospect) -> String {
        format!(
            "You're in! Your 7-day free trial for {business} starts now.\n\n\
             Forward your missed calls to this number and every lead gets texted straight to you.",
            business = p.business_name,
        )
    }

    pub fn trial_day5(&self, p: &Prospect) -> String {
        format!(
            "Hi {owner}, how's the trial going at {business}?\n\n\
             You have 2 days left. If you've forwarded your missed calls, \
             check your texts: every captured lead is money saved.\n\n\
             Any questions? Just reply here.",
            owner = p.salutation(),
            business = p.business_name,
        )
    }

    pub fn trial_day7(&self, p: &Prospect) -> String {
        format!(
            "Hi {owner}, your free trial ends today.\n\n\
             Keep your AI receptionist for {business}, no setup fee.\n\n\
             Activate now: {link}\n\n\
             Takes 60 seconds.",
            owner = p.salutation(),
            business = p.business_name,
            link = self.payment_link,
        )
    }

    fn trial_link_for(&self, p: &Prospect) -> String {
        let sep = if self.trial_link.contains('?') { '&' } else { '?' };
        format!("{}{sep}phone={}", self.trial_link, p.phone)
    }
}
