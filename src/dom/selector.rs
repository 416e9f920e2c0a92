/// Typed element matcher, covering the attribute selectors the pipeline needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// `[data-testid="…"]`
    TestId(&'static str),
    /// `[data-testid*="…"]`
    TestIdContains(&'static str),
    /// Element by tag name.
    Tag(&'static str),
    /// `[attr]`
    HasAttr(&'static str),
    /// `[attr="value"]`
    AttrEq(&'static str, &'static str),
    /// `a[href^="/"]`
    ProfileLink,
    /// `a[href="/user"], a[href^="/user?"]`
    LinkTo(String),
    /// `img[src*="…"]`
    ImgSrcContains(&'static str),
    AnyOf(Vec<Selector>),
}

impl Selector {
    pub fn link_to(username: &str) -> Self {
        Selector::LinkTo(username.to_string())
    }

    pub(crate) fn matches(&self, tag: &str, attr: &dyn Fn(&str) -> Option<String>) -> bool {
        match self {
            Selector::TestId(id) => attr("data-testid").as_deref() == Some(*id),
            Selector::TestIdContains(part) => attr("data-testid").is_some_and(|v| v.contains(part)),
            Selector::Tag(name) => tag.eq_ignore_ascii_case(name),
            Selector::HasAttr(name) => attr(name).is_some(),
            Selector::AttrEq(name, value) => attr(name).as_deref() == Some(*value),
            Selector::ProfileLink => {
                tag.eq_ignore_ascii_case("a") && attr("href").is_some_and(|h| h.starts_with('/'))
            }
            Selector::LinkTo(username) => {
                tag.eq_ignore_ascii_case("a")
                    && attr("href").is_some_and(|h| {
                        h.strip_prefix('/')
                            .and_then(|rest| rest.strip_prefix(username.as_str()))
                            .is_some_and(|tail| tail.is_empty() || tail.starts_with('?'))
                    })
            }
            Selector::ImgSrcContains(part) => {
                tag.eq_ignore_ascii_case("img") && attr("src").is_some_and(|s| s.contains(part))
            }
            Selector::AnyOf(options) => options.iter().any(|s| s.matches(tag, attr)),
        }
    }
}
